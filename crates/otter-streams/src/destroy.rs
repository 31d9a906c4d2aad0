//! Teardown and deferred construction shared by all stream kinds.
//!
//! Destroy is idempotent: the first call marks every present half
//! destroyed, runs the destroy hook once and, when it completes, emits
//! `error` (if any) and then `close` on a later tick. A destroy requested
//! while the construct hook is still pending waits for it to finish.

use crate::error::StreamError;
use crate::options::{Callback, ConstructHook};
use crate::state::PendingDestroy;
use crate::stream::StreamCore;
use crate::events::StreamEvent;
use crate::writable;
use std::sync::Arc;

pub(crate) fn destroy(core: &Arc<StreamCore>, error: Option<StreamError>, callback: Option<Callback>) {
    {
        let mut state = core.state.lock();
        if state.any_destroyed() {
            drop(state);
            if let Some(callback) = callback {
                callback(None);
            }
            return;
        }

        if state.w.present && (!state.w.buffered.is_empty() || !state.w.on_finished.is_empty()) {
            let c = core.clone();
            core.event_loop.next_tick(move || writable::error_buffer(&c));
        }

        state.record_error(error.as_ref());
        if state.w.present {
            state.w.destroyed = true;
        }
        if state.r.present {
            state.r.destroyed = true;
        }

        if !state.constructed() {
            tracing::debug!(stream_id = %core.id, "Destroy deferred until construction completes");
            state.pending_destroy = Some(PendingDestroy { error, callback });
            return;
        }
    }
    run_destroy_hook(core, error, callback);
}

fn run_destroy_hook(core: &Arc<StreamCore>, error: Option<StreamError>, callback: Option<Callback>) {
    tracing::debug!(stream_id = %core.id, error = ?error, "Destroying stream");
    let c = core.clone();
    let on_destroy: Callback = Box::new(move |err| {
        {
            let mut state = c.state.lock();
            state.record_error(err.as_ref());
            if state.w.present {
                state.w.closed = true;
            }
            if state.r.present {
                state.r.closed = true;
            }
        }
        if let Some(callback) = callback {
            callback(err.clone());
        }
        let core = c.clone();
        match err {
            Some(err) => c.event_loop.next_tick(move || {
                emit_error_nt(&core, err);
                emit_close_nt(&core);
            }),
            None => c.event_loop.next_tick(move || emit_close_nt(&core)),
        }
    });

    match core.hooks.destroy.clone() {
        Some(hook) => hook(error, on_destroy),
        None => on_destroy(error),
    }
}

fn emit_close_nt(core: &Arc<StreamCore>) {
    let emit = {
        let mut state = core.state.lock();
        if state.w.present {
            state.w.close_emitted = true;
        }
        if state.r.present {
            state.r.close_emitted = true;
        }
        (state.w.present && state.w.emit_close) || (state.r.present && state.r.emit_close)
    };
    if emit {
        core.emit(StreamEvent::Close);
    }
}

pub(crate) fn emit_error_nt(core: &Arc<StreamCore>, error: StreamError) {
    {
        let mut state = core.state.lock();
        if state.error_emitted() {
            return;
        }
        if state.w.present {
            state.w.error_emitted = true;
        }
        if state.r.present {
            state.r.error_emitted = true;
        }
    }
    core.emit_error(error);
}

/// Report an asynchronous failure: destroy when auto-destroy is on,
/// otherwise record and emit the error.
pub(crate) fn error_or_destroy(core: &Arc<StreamCore>, error: StreamError, sync: bool) {
    let auto_destroy = {
        let mut state = core.state.lock();
        if state.any_destroyed() {
            return;
        }
        let auto_destroy = (state.r.present && state.r.auto_destroy)
            || (state.w.present && state.w.auto_destroy);
        if !auto_destroy {
            state.record_error(Some(&error));
        }
        auto_destroy
    };

    if auto_destroy {
        destroy(core, Some(error), None);
    } else if sync {
        let c = core.clone();
        core.event_loop.next_tick(move || emit_error_nt(&c, error));
    } else {
        emit_error_nt(core, error);
    }
}

/// Reset every teardown flag so the stream can be reused.
pub(crate) fn undestroy(core: &Arc<StreamCore>) {
    let mut state = core.state.lock();
    if state.r.present {
        let r = &mut state.r;
        r.constructed = true;
        r.closed = false;
        r.close_emitted = false;
        r.destroyed = false;
        r.errored = None;
        r.error_emitted = false;
        r.reading = false;
        r.ended = !r.readable;
        r.end_emitted = !r.readable;
    }
    if state.w.present {
        let w = &mut state.w;
        w.constructed = true;
        w.destroyed = false;
        w.closed = false;
        w.close_emitted = false;
        w.errored = None;
        w.error_emitted = false;
        w.final_called = false;
        w.prefinished = false;
        w.ended = !w.writable;
        w.ending = !w.writable;
        w.finished = !w.writable;
    }
}

/// Run the construct hook, if any, before `on_ready`.
///
/// Requests made while construction is pending share the single hook
/// invocation.
pub(crate) fn construct(core: &Arc<StreamCore>, on_ready: Box<dyn FnOnce() + Send>) {
    let Some(hook) = core.hooks.construct.clone() else {
        return;
    };
    let first = {
        let mut state = core.state.lock();
        if state.r.present {
            state.r.constructed = false;
        }
        if state.w.present {
            state.w.constructed = false;
        }
        state.construct_waiters.push(on_ready);
        state.construct_waiters.len() == 1
    };
    if !first {
        return;
    }
    let c = core.clone();
    core.event_loop.next_tick(move || construct_nt(&c, hook));
}

fn construct_nt(core: &Arc<StreamCore>, hook: ConstructHook) {
    let c = core.clone();
    let callback: Callback = Box::new(move |err| {
        let core = c.clone();
        c.event_loop.next_tick(move || on_construct(&core, err));
    });
    hook(callback);
}

fn on_construct(core: &Arc<StreamCore>, error: Option<StreamError>) {
    let (destroyed, pending) = {
        let mut state = core.state.lock();
        if state.r.present {
            state.r.constructed = true;
        }
        if state.w.present {
            state.w.constructed = true;
        }
        (state.any_destroyed(), state.pending_destroy.take())
    };
    tracing::trace!(stream_id = %core.id, error = ?error, destroyed, "Construction completed");

    if destroyed {
        if let Some(pending) = pending {
            run_destroy_hook(
                core,
                StreamError::aggregate(error, pending.error),
                pending.callback,
            );
        }
    } else if let Some(error) = error {
        error_or_destroy(core, error, true);
    } else {
        let c = core.clone();
        core.event_loop.next_tick(move || {
            let waiters = std::mem::take(&mut c.state.lock().construct_waiters);
            for waiter in waiters {
                waiter();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use crate::event_loop::EventLoop;
    use crate::events::EventKind;
    use crate::options::ReadableOptions;
    use crate::readable::Readable;
    use crate::stream::NodeStream;
    use crate::error::StreamError;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record(stream: &Readable) -> Arc<Mutex<Vec<String>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        for kind in [EventKind::Error, EventKind::Close] {
            let events = events.clone();
            stream.on(kind, move |event| events.lock().push(event.kind().as_str().to_string()));
        }
        events
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let event_loop = EventLoop::new();
        let hook_calls = Arc::new(AtomicUsize::new(0));
        let calls = hook_calls.clone();
        let stream = Readable::new(
            &event_loop,
            ReadableOptions::new()
                .read(|_, _| Ok(()))
                .destroy(move |err, cb| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    cb(err)
                }),
        );
        let events = record(&stream);

        stream.destroy(Some(StreamError::custom("boom")));
        stream.destroy(Some(StreamError::custom("again")));
        event_loop.run_until_idle();

        assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
        assert_eq!(*events.lock(), vec!["error", "close"]);
        assert_eq!(stream.errored(), Some(StreamError::custom("boom")));
        assert!(stream.is_destroyed());
        assert!(stream.is_closed());
    }

    #[test]
    fn test_destroy_waits_for_construct() {
        let event_loop = EventLoop::new();
        let pending: Arc<Mutex<Option<crate::options::Callback>>> = Arc::new(Mutex::new(None));
        let slot = pending.clone();
        let destroyed_hook = Arc::new(AtomicUsize::new(0));
        let counter = destroyed_hook.clone();
        let stream = Readable::new(
            &event_loop,
            ReadableOptions::new()
                .read(|_, _| Ok(()))
                .construct(move |cb| *slot.lock() = Some(cb))
                .destroy(move |err, cb| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    cb(err)
                }),
        );
        let events = record(&stream);
        event_loop.run_until_idle();

        stream.destroy(None);
        event_loop.run_until_idle();
        assert_eq!(destroyed_hook.load(Ordering::SeqCst), 0);
        assert!(events.lock().is_empty());

        let cb = pending.lock().take().unwrap();
        cb(None);
        event_loop.run_until_idle();
        assert_eq!(destroyed_hook.load(Ordering::SeqCst), 1);
        assert_eq!(*events.lock(), vec!["close"]);
    }

    #[test]
    fn test_construct_failure_destroys() {
        let event_loop = EventLoop::new();
        let stream = Readable::new(
            &event_loop,
            ReadableOptions::new()
                .read(|_, _| Ok(()))
                .construct(|cb| cb(Some(StreamError::custom("no resource")))),
        );
        let events = record(&stream);
        event_loop.run_until_idle();

        assert_eq!(*events.lock(), vec!["error", "close"]);
        assert!(stream.is_destroyed());
    }

    #[test]
    fn test_error_without_auto_destroy_keeps_stream() {
        let event_loop = EventLoop::new();
        let stream = Readable::new(
            &event_loop,
            ReadableOptions::new().auto_destroy(false).read(|_, _| Ok(())),
        );
        let events = record(&stream);

        super::error_or_destroy(stream.core(), StreamError::custom("soft"), true);
        event_loop.run_until_idle();

        assert_eq!(*events.lock(), vec!["error"]);
        assert!(!stream.is_destroyed());
        assert_eq!(stream.errored(), Some(StreamError::custom("soft")));
    }

    #[test]
    fn test_undestroy_resets_flags() {
        let event_loop = EventLoop::new();
        let stream = Readable::new(&event_loop, ReadableOptions::new().read(|_, _| Ok(())));
        stream.on(EventKind::Error, |_| {});
        stream.destroy(Some(StreamError::custom("x")));
        event_loop.run_until_idle();
        assert!(stream.is_destroyed());

        super::undestroy(stream.core());
        assert!(!stream.is_destroyed());
        assert!(!stream.is_closed());
        assert_eq!(stream.errored(), None);
    }
}
