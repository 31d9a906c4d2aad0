//! The shared stream object and the traits every handle implements.
//!
//! Each stream is one [`StreamCore`] behind an `Arc`. The handle types
//! ([`Readable`], [`Writable`], [`Duplex`]) are thin views over it, so a
//! duplex can be handed out as either side without copying state.
//!
//! The state lock is never held while a hook or listener runs; hooks are
//! free to call back into the stream.

use crate::destroy;
use crate::duplex::Duplex;
use crate::error::StreamError;
use crate::event_loop::EventLoop;
use crate::events::{EventEmitter, EventKind, ListenerFn, ListenerId, StreamEvent, StreamId};
use crate::options::{Callback, Hooks};
use crate::readable::{self, Readable};
use crate::state::{Halves, ReadableState, StreamStatus, WritableState};
use crate::writable::Writable;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// One stream object: both state halves, its hooks and its listeners.
pub struct StreamCore {
    pub(crate) id: StreamId,
    pub(crate) event_loop: EventLoop,
    pub(crate) emitter: EventEmitter,
    pub(crate) state: Mutex<Halves>,
    pub(crate) hooks: Hooks,
    pub(crate) allow_half_open: bool,
}

impl std::fmt::Debug for StreamCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("StreamCore")
            .field("id", &self.id)
            .field("readable", &state.r.present)
            .field("writable", &state.w.present)
            .field("destroyed", &state.all_destroyed())
            .finish()
    }
}

impl StreamCore {
    pub(crate) fn new(
        event_loop: &EventLoop,
        r: ReadableState,
        w: WritableState,
        hooks: Hooks,
        allow_half_open: bool,
    ) -> Arc<Self> {
        let id = StreamId(NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed));
        tracing::trace!(
            stream_id = %id,
            readable = r.present,
            writable = w.present,
            "Creating stream"
        );
        Arc::new(Self {
            id,
            event_loop: event_loop.clone(),
            emitter: EventEmitter::new(),
            state: Mutex::new(Halves::new(r, w)),
            hooks,
            allow_half_open,
        })
    }

    pub(crate) fn is_readable_stream(&self) -> bool {
        self.state.lock().r.present
    }

    pub(crate) fn is_writable_stream(&self) -> bool {
        self.state.lock().w.present
    }

    /// Register a listener, applying the readable-side effects of `data`
    /// and `readable` subscriptions.
    pub(crate) fn add_listener(
        self: &Arc<Self>,
        kind: EventKind,
        callback: ListenerFn,
        once: bool,
        prepend: bool,
    ) -> ListenerId {
        let id = self.emitter.add_listener(kind, callback, once, prepend);
        if matches!(kind, EventKind::Data | EventKind::Readable) && self.is_readable_stream() {
            readable::on_listener_added(self, kind);
        }
        id
    }

    pub(crate) fn remove_listener(self: &Arc<Self>, kind: EventKind, id: ListenerId) -> bool {
        let removed = self.emitter.remove_listener(kind, id);
        if removed && kind == EventKind::Readable && self.is_readable_stream() {
            let core = self.clone();
            self.event_loop
                .next_tick(move || readable::update_readable_listening(&core));
        }
        removed
    }

    pub(crate) fn emit(&self, event: StreamEvent) -> bool {
        self.emitter.emit(&event)
    }

    /// Emit `error`, escalating to the loop when nobody listens.
    pub(crate) fn emit_error(&self, error: StreamError) {
        if !self.emitter.emit(&StreamEvent::Error(error.clone())) {
            tracing::warn!(stream_id = %self.id, error = %error, "Unhandled stream error");
            self.event_loop.report_unhandled(error);
        }
    }

    pub(crate) fn status(&self) -> StreamStatus {
        self.state.lock().status(self.id)
    }
}

mod sealed {
    pub trait Sealed {}
}

/// Operations common to every stream handle.
pub trait NodeStream: sealed::Sealed + Send + Sync {
    #[doc(hidden)]
    fn core(&self) -> &Arc<StreamCore>;

    /// Process-unique identity of the underlying stream object.
    fn id(&self) -> StreamId {
        self.core().id
    }

    /// Loop this stream schedules its deferred work on.
    fn event_loop(&self) -> &EventLoop {
        &self.core().event_loop
    }

    /// Subscribe to `kind`. A `data` listener switches a readable into
    /// flowing mode; a `readable` listener switches it to paused mode.
    fn on<F>(&self, kind: EventKind, callback: F) -> ListenerId
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
        Self: Sized,
    {
        self.core().add_listener(kind, Arc::new(callback), false, false)
    }

    fn once<F>(&self, kind: EventKind, callback: F) -> ListenerId
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
        Self: Sized,
    {
        self.core().add_listener(kind, Arc::new(callback), true, false)
    }

    fn prepend_listener<F>(&self, kind: EventKind, callback: F) -> ListenerId
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
        Self: Sized,
    {
        self.core().add_listener(kind, Arc::new(callback), false, true)
    }

    fn off(&self, kind: EventKind, id: ListenerId) -> bool {
        self.core().remove_listener(kind, id)
    }

    fn listener_count(&self, kind: EventKind) -> usize {
        self.core().emitter.listener_count(kind)
    }

    fn set_max_listeners(&self, n: usize) {
        self.core().emitter.set_max_listeners(n);
    }

    /// Tear the stream down. Idempotent; `error`, if any, is emitted before
    /// `close`.
    fn destroy(&self, error: Option<StreamError>) {
        destroy::destroy(self.core(), error, None);
    }

    /// Like [`destroy`](Self::destroy), calling `callback` once the destroy
    /// hook completed.
    fn destroy_with<F>(&self, error: Option<StreamError>, callback: F)
    where
        F: FnOnce(Option<StreamError>) + Send + 'static,
        Self: Sized,
    {
        let callback: Callback = Box::new(callback);
        destroy::destroy(self.core(), error, Some(callback));
    }

    /// True once every present half is destroyed.
    fn is_destroyed(&self) -> bool {
        self.core().state.lock().all_destroyed()
    }

    fn is_closed(&self) -> bool {
        self.core().state.lock().closed()
    }

    fn errored(&self) -> Option<StreamError> {
        self.core().state.lock().errored()
    }

    fn status(&self) -> StreamStatus {
        self.core().status()
    }
}

/// Handles with a readable side.
pub trait ReadableStream: NodeStream {
    /// Readable view sharing this stream's state.
    fn as_readable(&self) -> Readable {
        Readable::from_core(self.core().clone())
    }
}

/// Handles with a writable side.
pub trait WritableStream: NodeStream {
    /// Writable view sharing this stream's state.
    fn as_writable(&self) -> Writable {
        Writable::from_core(self.core().clone())
    }
}

macro_rules! impl_node_stream {
    ($($ty:ty),* $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}
            impl NodeStream for $ty {
                fn core(&self) -> &Arc<StreamCore> {
                    &self.core
                }
            }
        )*
    };
}

impl_node_stream!(Readable, Writable, Duplex);

impl ReadableStream for Readable {}
impl ReadableStream for Duplex {}
impl WritableStream for Writable {}
impl WritableStream for Duplex {}

impl sealed::Sealed for crate::transform::Transform {}
impl NodeStream for crate::transform::Transform {
    fn core(&self) -> &Arc<StreamCore> {
        &self.duplex.core
    }
}
impl ReadableStream for crate::transform::Transform {}
impl WritableStream for crate::transform::Transform {}

/// Any stream handle, as returned by `pipeline`.
#[derive(Debug, Clone)]
pub enum AnyStream {
    Readable(Readable),
    Writable(Writable),
    Duplex(Duplex),
}

impl AnyStream {
    pub(crate) fn from_core(core: Arc<StreamCore>) -> Self {
        let (r, w) = {
            let state = core.state.lock();
            (state.r.present, state.w.present)
        };
        match (r, w) {
            (true, true) => AnyStream::Duplex(Duplex::from_core(core)),
            (true, false) => AnyStream::Readable(Readable::from_core(core)),
            _ => AnyStream::Writable(Writable::from_core(core)),
        }
    }

    /// Readable view, when the stream has a readable side.
    pub fn as_readable(&self) -> Option<Readable> {
        self.core()
            .is_readable_stream()
            .then(|| Readable::from_core(self.core().clone()))
    }

    /// Writable view, when the stream has a writable side.
    pub fn as_writable(&self) -> Option<Writable> {
        self.core()
            .is_writable_stream()
            .then(|| Writable::from_core(self.core().clone()))
    }
}

impl sealed::Sealed for AnyStream {}
impl NodeStream for AnyStream {
    fn core(&self) -> &Arc<StreamCore> {
        match self {
            AnyStream::Readable(s) => &s.core,
            AnyStream::Writable(s) => &s.core,
            AnyStream::Duplex(s) => &s.core,
        }
    }
}

impl From<Readable> for AnyStream {
    fn from(value: Readable) -> Self {
        AnyStream::Readable(value)
    }
}

impl From<Writable> for AnyStream {
    fn from(value: Writable) -> Self {
        AnyStream::Writable(value)
    }
}

impl From<Duplex> for AnyStream {
    fn from(value: Duplex) -> Self {
        AnyStream::Duplex(value)
    }
}

impl From<crate::transform::Transform> for AnyStream {
    fn from(value: crate::transform::Transform) -> Self {
        AnyStream::Duplex(value.into_duplex())
    }
}
