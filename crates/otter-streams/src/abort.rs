//! Abort signals for external cancellation.
//!
//! A stream attached to an [`AbortSignal`] is destroyed with
//! [`StreamError::Aborted`] when the signal fires. The listener is removed
//! once the stream finished on its own.

use crate::destroy;
use crate::end_of_stream::{FinishedOptions, eos};
use crate::error::{StreamError, StreamResult};
use crate::stream::NodeStream;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

type AbortListener = Box<dyn FnOnce(Option<StreamError>) + Send>;

#[derive(Default)]
struct SignalState {
    aborted: bool,
    reason: Option<StreamError>,
    listeners: Vec<(u64, AbortListener)>,
}

#[derive(Default)]
struct SignalInner {
    state: Mutex<SignalState>,
    next_listener_id: AtomicU64,
}

/// Cancellation token handed to streams and `pipeline`.
#[derive(Clone, Default)]
pub struct AbortSignal {
    inner: Arc<SignalInner>,
}

impl std::fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("AbortSignal")
            .field("aborted", &state.aborted)
            .field("reason", &state.reason)
            .finish()
    }
}

impl AbortSignal {
    /// A signal that is already aborted.
    pub fn abort(reason: Option<StreamError>) -> Self {
        let signal = Self::default();
        signal.fire(reason);
        signal
    }

    pub fn aborted(&self) -> bool {
        self.inner.state.lock().aborted
    }

    pub fn reason(&self) -> Option<StreamError> {
        self.inner.state.lock().reason.clone()
    }

    pub fn throw_if_aborted(&self) -> StreamResult<()> {
        let state = self.inner.state.lock();
        if state.aborted {
            return Err(StreamError::aborted(state.reason.clone()));
        }
        Ok(())
    }

    /// Register `listener` for the abort. Returns `None` without registering
    /// when the signal already fired.
    pub(crate) fn on_abort<F>(&self, listener: F) -> Option<u64>
    where
        F: FnOnce(Option<StreamError>) + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        if state.aborted {
            return None;
        }
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        state.listeners.push((id, Box::new(listener)));
        Some(id)
    }

    pub(crate) fn remove_listener(&self, id: u64) {
        self.inner.state.lock().listeners.retain(|(lid, _)| *lid != id);
    }

    fn fire(&self, reason: Option<StreamError>) {
        let listeners = {
            let mut state = self.inner.state.lock();
            if state.aborted {
                return;
            }
            state.aborted = true;
            state.reason = reason.clone();
            std::mem::take(&mut state.listeners)
        };
        tracing::debug!(listeners = listeners.len(), reason = ?reason, "Abort signal fired");
        for (_, listener) in listeners {
            listener(reason.clone());
        }
    }
}

/// Owner side of an [`AbortSignal`].
#[derive(Debug, Clone, Default)]
pub struct AbortController {
    signal: AbortSignal,
}

impl AbortController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    /// Fire the signal. Only the first call has an effect.
    pub fn abort(&self, reason: Option<StreamError>) {
        self.signal.fire(reason);
    }
}

/// Destroy `stream` with an abort error when `signal` fires.
pub fn add_abort_signal<S>(signal: &AbortSignal, stream: &S)
where
    S: NodeStream + ?Sized,
{
    let core = stream.core();
    let weak = Arc::downgrade(core);
    let listener = signal.on_abort(move |reason| {
        if let Some(core) = weak.upgrade() {
            destroy::destroy(&core, Some(StreamError::aborted(reason)), None);
        }
    });

    match listener {
        None => destroy::destroy(core, Some(StreamError::aborted(signal.reason())), None),
        Some(id) => {
            let signal = signal.clone();
            let _watcher = eos(
                core,
                FinishedOptions::default(),
                Box::new(move |_| signal.remove_listener(id)),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use crate::events::{EventKind, StreamEvent};
    use crate::options::ReadableOptions;
    use crate::readable::Readable;

    #[test]
    fn test_controller_fires_once() {
        let controller = AbortController::new();
        let signal = controller.signal();
        assert!(!signal.aborted());
        assert_eq!(signal.throw_if_aborted(), Ok(()));

        controller.abort(Some(StreamError::custom("first")));
        controller.abort(Some(StreamError::custom("second")));

        assert!(signal.aborted());
        assert_eq!(signal.reason(), Some(StreamError::custom("first")));
        assert_eq!(
            signal.throw_if_aborted(),
            Err(StreamError::aborted(Some(StreamError::custom("first"))))
        );
    }

    #[test]
    fn test_abort_destroys_stream() {
        let event_loop = EventLoop::new();
        let controller = AbortController::new();
        let stream = Readable::new(
            &event_loop,
            ReadableOptions::new()
                .read(|_, _| Ok(()))
                .signal(controller.signal()),
        );
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        stream.on(EventKind::Error, move |event| {
            if let StreamEvent::Error(err) = event {
                sink.lock().push(err.clone());
            }
        });

        controller.abort(None);
        event_loop.run_until_idle();

        assert!(stream.is_destroyed());
        assert_eq!(*errors.lock(), vec![StreamError::aborted(None)]);
        assert!(errors.lock()[0].is_abort());
    }

    #[test]
    fn test_already_aborted_signal() {
        let event_loop = EventLoop::new();
        let signal = AbortSignal::abort(Some(StreamError::custom("late")));
        let stream = Readable::new(&event_loop, ReadableOptions::new().read(|_, _| Ok(())));
        stream.on(EventKind::Error, |_| {});
        add_abort_signal(&signal, &stream);
        event_loop.run_until_idle();

        assert!(stream.is_destroyed());
        assert_eq!(
            stream.errored(),
            Some(StreamError::aborted(Some(StreamError::custom("late"))))
        );
    }

    #[test]
    fn test_listener_removed_after_finish() {
        let event_loop = EventLoop::new();
        let controller = AbortController::new();
        let stream = Readable::new(&event_loop, ReadableOptions::new().read(|_, _| Ok(())));
        add_abort_signal(&controller.signal(), &stream);
        assert_eq!(controller.signal.inner.state.lock().listeners.len(), 1);

        stream.push(None);
        stream.resume();
        event_loop.run_until_idle();
        assert_eq!(controller.signal.inner.state.lock().listeners.len(), 0);

        controller.abort(None);
        event_loop.run_until_idle();
        assert_eq!(stream.errored(), None);
    }
}
