//! Per-stream event listeners.
//!
//! Each stream owns one [`EventEmitter`]. Listeners are plain callbacks keyed
//! by [`EventKind`]; a listener registered with `once` is removed before it
//! runs, so it fires at most once.

use crate::chunk::Chunk;
use crate::error::StreamError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Default maximum number of listeners per event before a leak warning.
pub const DEFAULT_MAX_LISTENERS: usize = 10;

/// Unique listener ID for tracking callbacks.
static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

fn next_listener_id() -> u64 {
    NEXT_LISTENER_ID.fetch_add(1, Ordering::SeqCst)
}

/// Identity of a stream instance, used in `pipe`/`unpipe` payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Signals a stream can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Data,
    Readable,
    End,
    Drain,
    Finish,
    Prefinish,
    Pipe,
    Unpipe,
    Close,
    Error,
    Pause,
    Resume,
}

impl EventKind {
    /// Node.js event name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Readable => "readable",
            Self::End => "end",
            Self::Drain => "drain",
            Self::Finish => "finish",
            Self::Prefinish => "prefinish",
            Self::Pipe => "pipe",
            Self::Unpipe => "unpipe",
            Self::Close => "close",
            Self::Error => "error",
            Self::Pause => "pause",
            Self::Resume => "resume",
        }
    }
}

/// An emitted event with its payload.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A chunk delivered to consumers.
    Data(Chunk),
    /// Data (or end-of-data) is available to `read()`.
    Readable,
    /// No more data will be emitted.
    End,
    /// The write buffer drained below the high-water mark.
    Drain,
    /// All writes were flushed after `end()`.
    Finish,
    /// Emitted right before `finish`, after the final hook.
    Prefinish,
    /// A source started piping into this stream.
    Pipe(StreamId),
    /// A source stopped piping into this stream.
    Unpipe(StreamId),
    /// The stream and its resources are closed.
    Close,
    /// The stream failed.
    Error(StreamError),
    /// The stream left flowing mode.
    Pause,
    /// The stream entered flowing mode.
    Resume,
}

impl StreamEvent {
    /// Kind of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Data(_) => EventKind::Data,
            Self::Readable => EventKind::Readable,
            Self::End => EventKind::End,
            Self::Drain => EventKind::Drain,
            Self::Finish => EventKind::Finish,
            Self::Prefinish => EventKind::Prefinish,
            Self::Pipe(_) => EventKind::Pipe,
            Self::Unpipe(_) => EventKind::Unpipe,
            Self::Close => EventKind::Close,
            Self::Error(_) => EventKind::Error,
            Self::Pause => EventKind::Pause,
            Self::Resume => EventKind::Resume,
        }
    }
}

/// Listener callback.
pub type ListenerFn = Arc<dyn Fn(&StreamEvent) + Send + Sync>;

/// Handle returned when registering a listener, used to remove it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Clone)]
struct Listener {
    id: u64,
    once: bool,
    callback: ListenerFn,
}

/// Listener table of one emitter.
#[derive(Default)]
struct EventEmitterState {
    listeners: HashMap<EventKind, Vec<Listener>>,
    max_listeners: usize,
}

impl EventEmitterState {
    fn new() -> Self {
        Self {
            listeners: HashMap::new(),
            max_listeners: DEFAULT_MAX_LISTENERS,
        }
    }

    /// Returns the listener ID and whether the leak warning threshold was crossed.
    fn add_listener(&mut self, kind: EventKind, listener: Listener, prepend: bool) -> (u64, bool) {
        let id = listener.id;
        let listeners = self.listeners.entry(kind).or_default();
        if prepend {
            listeners.insert(0, listener);
        } else {
            listeners.push(listener);
        }
        let should_warn = self.max_listeners > 0 && listeners.len() > self.max_listeners;
        (id, should_warn)
    }

    fn remove_listener(&mut self, kind: EventKind, id: u64) -> bool {
        if let Some(listeners) = self.listeners.get_mut(&kind)
            && let Some(pos) = listeners.iter().position(|l| l.id == id)
        {
            listeners.remove(pos);
            return true;
        }
        false
    }

    fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.get(&kind).map(|l| l.len()).unwrap_or(0)
    }

    /// Snapshot the callbacks for one emit, dropping `once` listeners.
    fn take_for_emit(&mut self, kind: EventKind) -> Vec<ListenerFn> {
        let Some(listeners) = self.listeners.get_mut(&kind) else {
            return Vec::new();
        };
        let callbacks = listeners.iter().map(|l| l.callback.clone()).collect();
        listeners.retain(|l| !l.once);
        callbacks
    }
}

/// Thread-safe listener registry.
#[derive(Clone)]
pub struct EventEmitter {
    state: Arc<Mutex<EventEmitterState>>,
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        let counts: HashMap<&str, usize> = state
            .listeners
            .iter()
            .map(|(k, v)| (k.as_str(), v.len()))
            .collect();
        f.debug_struct("EventEmitter").field("listeners", &counts).finish()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventEmitter {
    /// Create an emitter with no listeners.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(EventEmitterState::new())),
        }
    }

    /// Set the leak warning threshold (0 = unlimited).
    pub fn set_max_listeners(&self, n: usize) {
        self.state.lock().max_listeners = n;
    }

    /// Get the leak warning threshold.
    pub fn max_listeners(&self) -> usize {
        self.state.lock().max_listeners
    }

    /// Register a listener.
    pub fn add_listener(
        &self,
        kind: EventKind,
        callback: ListenerFn,
        once: bool,
        prepend: bool,
    ) -> ListenerId {
        let listener = Listener {
            id: next_listener_id(),
            once,
            callback,
        };
        let (id, should_warn) = self.state.lock().add_listener(kind, listener, prepend);
        if should_warn {
            tracing::warn!(
                event = kind.as_str(),
                count = self.listener_count(kind),
                "Possible EventEmitter memory leak detected"
            );
        }
        ListenerId(id)
    }

    /// Register a listener that runs on every emit.
    pub fn on<F>(&self, kind: EventKind, callback: F) -> ListenerId
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        self.add_listener(kind, Arc::new(callback), false, false)
    }

    /// Register a listener that runs on the next emit only.
    pub fn once<F>(&self, kind: EventKind, callback: F) -> ListenerId
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        self.add_listener(kind, Arc::new(callback), true, false)
    }

    /// Remove a listener. Returns true if it was registered.
    pub fn remove_listener(&self, kind: EventKind, id: ListenerId) -> bool {
        self.state.lock().remove_listener(kind, id.0)
    }

    /// Remove all listeners for `kind`, or for every kind.
    pub fn remove_all_listeners(&self, kind: Option<EventKind>) {
        let mut state = self.state.lock();
        match kind {
            Some(kind) => {
                state.listeners.remove(&kind);
            }
            None => state.listeners.clear(),
        }
    }

    /// Number of listeners for `kind`.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.state.lock().listener_count(kind)
    }

    /// Kinds that currently have listeners.
    pub fn event_names(&self) -> Vec<EventKind> {
        self.state
            .lock()
            .listeners
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, _)| *k)
            .collect()
    }

    /// Call every listener for the event's kind. Returns whether any
    /// listener was registered.
    pub fn emit(&self, event: &StreamEvent) -> bool {
        let callbacks = self.state.lock().take_for_emit(event.kind());
        for callback in &callbacks {
            callback(event);
        }
        !callbacks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> ListenerFn) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log2 = log.clone();
        let make = move |tag: &str| -> ListenerFn {
            let log = log2.clone();
            let tag = tag.to_string();
            Arc::new(move |_event: &StreamEvent| log.lock().push(tag.clone()))
        };
        (log, make)
    }

    #[test]
    fn test_add_and_remove_listeners() {
        let emitter = EventEmitter::new();
        let (log, make) = recorder();

        let id = emitter.add_listener(EventKind::Data, make("a"), false, false);
        assert_eq!(emitter.listener_count(EventKind::Data), 1);
        assert!(emitter.emit(&StreamEvent::Data(Chunk::from("x"))));

        assert!(emitter.remove_listener(EventKind::Data, id));
        assert!(!emitter.remove_listener(EventKind::Data, id));
        assert!(!emitter.emit(&StreamEvent::Data(Chunk::from("x"))));
        assert_eq!(*log.lock(), vec!["a"]);
    }

    #[test]
    fn test_prepend_listener() {
        let emitter = EventEmitter::new();
        let (log, make) = recorder();

        emitter.add_listener(EventKind::End, make("second"), false, false);
        emitter.add_listener(EventKind::End, make("first"), false, true);
        emitter.emit(&StreamEvent::End);
        assert_eq!(*log.lock(), vec!["first", "second"]);
    }

    #[test]
    fn test_once_listeners() {
        let emitter = EventEmitter::new();
        let (log, make) = recorder();

        emitter.add_listener(EventKind::Close, make("once"), true, false);
        emitter.add_listener(EventKind::Close, make("always"), false, false);
        emitter.emit(&StreamEvent::Close);
        emitter.emit(&StreamEvent::Close);
        assert_eq!(*log.lock(), vec!["once", "always", "always"]);
        assert_eq!(emitter.listener_count(EventKind::Close), 1);
    }

    #[test]
    fn test_listener_may_register_during_emit() {
        let emitter = EventEmitter::new();
        let inner = emitter.clone();
        emitter.once(EventKind::Drain, move |_| {
            inner.on(EventKind::Drain, |_| {});
        });
        emitter.emit(&StreamEvent::Drain);
        assert_eq!(emitter.listener_count(EventKind::Drain), 1);
    }

    #[test]
    fn test_remove_all_listeners_and_names() {
        let emitter = EventEmitter::new();
        emitter.on(EventKind::Data, |_| {});
        emitter.on(EventKind::End, |_| {});
        assert_eq!(emitter.event_names().len(), 2);

        emitter.remove_all_listeners(Some(EventKind::Data));
        assert_eq!(emitter.event_names(), vec![EventKind::End]);
        emitter.remove_all_listeners(None);
        assert!(emitter.event_names().is_empty());
    }

    #[test]
    fn test_max_listeners_setting() {
        let emitter = EventEmitter::new();
        assert_eq!(emitter.max_listeners(), DEFAULT_MAX_LISTENERS);
        emitter.set_max_listeners(1);
        emitter.on(EventKind::Data, |_| {});
        emitter.on(EventKind::Data, |_| {});
        assert_eq!(emitter.listener_count(EventKind::Data), 2);
    }
}
