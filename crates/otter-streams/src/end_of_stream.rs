//! Completion detection for any stream (`finished`).
//!
//! The callback runs exactly once: when every watched side completed
//! (`end` for the readable side, `finish` for the writable side, deferred to
//! `close` when the stream is going to emit one), on `error`, or with
//! [`StreamError::PrematureClose`] when `close` arrives before the side it
//! was waiting for completed.

use crate::error::StreamError;
use crate::events::{EventKind, ListenerId, StreamEvent};
use crate::options::Callback;
use crate::stream::{NodeStream, StreamCore};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// Which sides [`finished`] waits for.
#[derive(Debug, Clone, Copy)]
pub struct FinishedOptions {
    /// Wait for the readable side; defaults to "if the stream has one".
    pub readable: Option<bool>,
    /// Wait for the writable side; defaults to "if the stream has one".
    pub writable: Option<bool>,
    /// Report `error` events. When off, only `close` reports failures.
    pub error: bool,
}

impl Default for FinishedOptions {
    fn default() -> Self {
        Self {
            readable: None,
            writable: None,
            error: true,
        }
    }
}

impl FinishedOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn readable(mut self, enabled: bool) -> Self {
        self.readable = Some(enabled);
        self
    }

    pub fn writable(mut self, enabled: bool) -> Self {
        self.writable = Some(enabled);
        self
    }

    pub fn error(mut self, enabled: bool) -> Self {
        self.error = enabled;
        self
    }
}

struct Progress {
    will_emit_close: bool,
    readable_finished: bool,
    writable_finished: bool,
}

struct Watch {
    callback: Mutex<Option<Callback>>,
    readable: bool,
    writable: bool,
    progress: Mutex<Progress>,
}

impl Watch {
    fn complete(&self, error: Option<StreamError>) {
        let callback = self.callback.lock().take();
        if let Some(callback) = callback {
            callback(error);
        }
    }
}

/// Detaches a [`finished`] watcher. Dropping it keeps the watcher active.
#[must_use = "call `run` to detach the watcher"]
pub struct Cleanup {
    core: Weak<StreamCore>,
    listeners: Vec<(EventKind, ListenerId)>,
    watch: Arc<Watch>,
}

impl std::fmt::Debug for Cleanup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cleanup")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl Cleanup {
    /// Remove the listeners; the callback will not run anymore.
    pub fn run(self) {
        self.watch.callback.lock().take();
        if let Some(core) = self.core.upgrade() {
            for (kind, id) in self.listeners {
                core.emitter.remove_listener(kind, id);
            }
        }
    }
}

/// Call `callback` once `stream` is done, failed or closed prematurely.
pub fn finished<S, F>(stream: &S, options: FinishedOptions, callback: F) -> Cleanup
where
    S: NodeStream + ?Sized,
    F: FnOnce(Option<StreamError>) + Send + 'static,
{
    eos(stream.core(), options, Box::new(callback))
}

pub(crate) fn eos(core: &Arc<StreamCore>, options: FinishedOptions, callback: Callback) -> Cleanup {
    let (is_readable_stream, is_writable_stream, snapshot) = {
        let state = core.state.lock();
        (
            state.r.present,
            state.w.present,
            (
                state.will_emit_close(),
                state.r.present && state.r.is_finished(false),
                state.w.present && state.w.is_finished(false),
                state.closed(),
                state.error_emitted(),
                state.r.present && state.r.is_readable(),
                state.w.present && state.w.is_writable(),
            ),
        )
    };
    let (will_emit_close, readable_finished, writable_finished, closed, error_emitted, is_readable, is_writable) =
        snapshot;

    let readable = options.readable.unwrap_or(is_readable_stream);
    let writable = options.writable.unwrap_or(is_writable_stream);
    let will_emit_close =
        will_emit_close && is_readable_stream == readable && is_writable_stream == writable;

    let watch = Arc::new(Watch {
        callback: Mutex::new(Some(callback)),
        readable,
        writable,
        progress: Mutex::new(Progress {
            will_emit_close,
            readable_finished,
            writable_finished,
        }),
    });

    let weak = Arc::downgrade(core);
    let mut listeners = Vec::with_capacity(4);

    {
        let watch = watch.clone();
        let weak = weak.clone();
        let id = core.add_listener(
            EventKind::End,
            Arc::new(move |_: &StreamEvent| {
                if let Some(core) = weak.upgrade() {
                    on_end(&core, &watch);
                }
            }),
            false,
            false,
        );
        listeners.push((EventKind::End, id));
    }
    {
        let watch = watch.clone();
        let weak = weak.clone();
        let id = core.add_listener(
            EventKind::Finish,
            Arc::new(move |_: &StreamEvent| {
                if let Some(core) = weak.upgrade() {
                    on_finish(&core, &watch);
                }
            }),
            false,
            false,
        );
        listeners.push((EventKind::Finish, id));
    }
    if options.error {
        let watch = watch.clone();
        let id = core.add_listener(
            EventKind::Error,
            Arc::new(move |event: &StreamEvent| {
                if let StreamEvent::Error(err) = event {
                    watch.complete(Some(err.clone()));
                }
            }),
            false,
            false,
        );
        listeners.push((EventKind::Error, id));
    }
    {
        let watch = watch.clone();
        let weak = weak.clone();
        let id = core.add_listener(
            EventKind::Close,
            Arc::new(move |_: &StreamEvent| {
                if let Some(core) = weak.upgrade() {
                    on_close(&core, &watch);
                }
            }),
            false,
            false,
        );
        listeners.push((EventKind::Close, id));
    }

    let check_now = if closed {
        true
    } else if error_emitted {
        !will_emit_close
    } else if !readable && (!will_emit_close || is_readable) && (writable_finished || !is_writable) {
        true
    } else {
        !writable && (!will_emit_close || is_writable) && (readable_finished || !is_readable)
    };
    if check_now {
        let c = core.clone();
        let w = watch.clone();
        core.event_loop.next_tick(move || on_close(&c, &w));
    }

    Cleanup {
        core: weak,
        listeners,
        watch,
    }
}

fn on_finish(core: &Arc<StreamCore>, watch: &Watch) {
    let (destroyed, stream_readable) = {
        let state = core.state.lock();
        (state.all_destroyed(), state.r.present && state.r.is_readable())
    };
    let done = {
        let mut progress = watch.progress.lock();
        progress.writable_finished = true;
        if destroyed {
            progress.will_emit_close = false;
        }
        if progress.will_emit_close && (!stream_readable || watch.readable) {
            return;
        }
        !watch.readable || progress.readable_finished
    };
    if done {
        watch.complete(None);
    }
}

fn on_end(core: &Arc<StreamCore>, watch: &Watch) {
    let (destroyed, stream_writable) = {
        let state = core.state.lock();
        (state.all_destroyed(), state.w.present && state.w.is_writable())
    };
    let done = {
        let mut progress = watch.progress.lock();
        progress.readable_finished = true;
        if destroyed {
            progress.will_emit_close = false;
        }
        if progress.will_emit_close && (!stream_writable || watch.writable) {
            return;
        }
        !watch.writable || progress.writable_finished
    };
    if done {
        watch.complete(None);
    }
}

fn on_close(core: &Arc<StreamCore>, watch: &Watch) {
    let (errored, strict_readable, readable_done, writable_done) = {
        let state = core.state.lock();
        (
            state.errored(),
            state.r.present && state.r.readable,
            state.r.present && state.r.is_finished(false),
            state.w.present && state.w.is_finished(false),
        )
    };
    if let Some(err) = errored {
        watch.complete(Some(err));
        return;
    }
    let (readable_finished, writable_finished) = {
        let progress = watch.progress.lock();
        (progress.readable_finished, progress.writable_finished)
    };
    if watch.readable && !readable_finished && strict_readable && !readable_done {
        watch.complete(Some(StreamError::PrematureClose));
        return;
    }
    if watch.writable && !writable_finished && !writable_done {
        watch.complete(Some(StreamError::PrematureClose));
        return;
    }
    watch.complete(None);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use crate::options::{ReadableOptions, WritableOptions};
    use crate::readable::Readable;
    use crate::writable::Writable;

    fn outcome() -> (Arc<Mutex<Vec<Option<StreamError>>>>, impl FnOnce(Option<StreamError>) + Send + 'static) {
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();
        (results, move |err| sink.lock().push(err))
    }

    #[test]
    fn test_readable_end() {
        let event_loop = EventLoop::new();
        let stream = Readable::new(&event_loop, ReadableOptions::new().read(|_, _| Ok(())));
        let (results, callback) = outcome();
        let _cleanup = finished(&stream, FinishedOptions::new(), callback);

        stream.push(Some("data".into()));
        stream.push(None);
        stream.resume();
        event_loop.run_until_idle();

        assert_eq!(*results.lock(), vec![None]);
    }

    #[test]
    fn test_writable_finish() {
        let event_loop = EventLoop::new();
        let stream = Writable::new(&event_loop, WritableOptions::new().write(|_, _, _, cb| cb(None)));
        let (results, callback) = outcome();
        let _cleanup = finished(&stream, FinishedOptions::new(), callback);

        stream.write("x").unwrap();
        stream.end();
        event_loop.run_until_idle();

        assert_eq!(*results.lock(), vec![None]);
    }

    #[test]
    fn test_premature_close() {
        let event_loop = EventLoop::new();
        let stream = Readable::new(&event_loop, ReadableOptions::new().read(|_, _| Ok(())));
        let (results, callback) = outcome();
        let _cleanup = finished(&stream, FinishedOptions::new(), callback);

        stream.destroy(None);
        event_loop.run_until_idle();

        assert_eq!(*results.lock(), vec![Some(StreamError::PrematureClose)]);
    }

    #[test]
    fn test_error_is_reported_once() {
        let event_loop = EventLoop::new();
        let stream = Writable::new(&event_loop, WritableOptions::new().write(|_, _, _, cb| cb(None)));
        let (results, callback) = outcome();
        let _cleanup = finished(&stream, FinishedOptions::new(), callback);

        stream.destroy(Some(StreamError::custom("boom")));
        event_loop.run_until_idle();

        assert_eq!(*results.lock(), vec![Some(StreamError::custom("boom"))]);
    }

    #[test]
    fn test_already_finished_stream() {
        let event_loop = EventLoop::new();
        let stream = Writable::new(&event_loop, WritableOptions::new().write(|_, _, _, cb| cb(None)));
        stream.end();
        event_loop.run_until_idle();
        assert!(stream.is_closed());

        let (results, callback) = outcome();
        let _cleanup = finished(&stream, FinishedOptions::new(), callback);
        event_loop.run_until_idle();
        assert_eq!(*results.lock(), vec![None]);
    }

    #[test]
    fn test_cleanup_detaches() {
        let event_loop = EventLoop::new();
        let stream = Readable::new(&event_loop, ReadableOptions::new().read(|_, _| Ok(())));
        let before = stream.listener_count(EventKind::Close);
        let (results, callback) = outcome();
        let cleanup = finished(&stream, FinishedOptions::new(), callback);
        assert_eq!(stream.listener_count(EventKind::Close), before + 1);

        cleanup.run();
        assert_eq!(stream.listener_count(EventKind::Close), before);
        stream.destroy(None);
        event_loop.run_until_idle();
        assert!(results.lock().is_empty());
    }
}
