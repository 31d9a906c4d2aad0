//! Construction options and user hooks.
//!
//! Options follow the builder shape: `Default` gives Node.js defaults and
//! chained setters override single fields.
//!
//! ```ignore
//! let options = ReadableOptions::new()
//!     .object_mode(true)
//!     .high_water_mark(2)
//!     .read(|stream, _size| {
//!         stream.push(Some(Chunk::from("tick")));
//!         Ok(())
//!     });
//! ```

use crate::abort::AbortSignal;
use crate::chunk::{Chunk, Encoding};
use crate::error::{StreamError, StreamResult};
use crate::readable::Readable;
use crate::writable::Writable;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Completion callback handed to hooks. Being `FnOnce`, it can only be
/// invoked once.
pub type Callback = Box<dyn FnOnce(Option<StreamError>) + Send>;

/// Completion callback of the transform and flush hooks. `Ok(Some(chunk))`
/// pushes the chunk before completing.
pub type TransformCallback = Box<dyn FnOnce(StreamResult<Option<Chunk>>) + Send>;

/// Pull hook: asked to produce about `size` units via `push`.
pub type ReadHook = Arc<dyn Fn(&Readable, usize) -> StreamResult<()> + Send + Sync>;
/// Sink hook for one chunk.
pub type WriteHook = Arc<dyn Fn(&Writable, Chunk, Encoding, Callback) + Send + Sync>;
/// Batched sink hook for everything buffered.
pub type WritevHook = Arc<dyn Fn(&Writable, Vec<(Chunk, Encoding)>, Callback) + Send + Sync>;
/// Runs once before `finish`.
pub type FinalHook = Arc<dyn Fn(&Writable, Callback) + Send + Sync>;
/// Runs once before the first read or write is dispatched.
pub type ConstructHook = Arc<dyn Fn(Callback) + Send + Sync>;
/// Releases resources on destroy.
pub type DestroyHook = Arc<dyn Fn(Option<StreamError>, Callback) + Send + Sync>;
/// Transforms one written chunk.
pub type TransformHook = Arc<dyn Fn(&Readable, Chunk, Encoding, TransformCallback) + Send + Sync>;
/// Emits trailing output when the writable side ends.
pub type FlushHook = Arc<dyn Fn(&Readable, TransformCallback) + Send + Sync>;

static DEFAULT_BYTE_HWM: AtomicUsize = AtomicUsize::new(16 * 1024);
static DEFAULT_OBJECT_HWM: AtomicUsize = AtomicUsize::new(16);

/// Process-wide default high-water mark for the given mode.
pub fn default_high_water_mark(object_mode: bool) -> usize {
    if object_mode {
        DEFAULT_OBJECT_HWM.load(Ordering::Relaxed)
    } else {
        DEFAULT_BYTE_HWM.load(Ordering::Relaxed)
    }
}

/// Change the default high-water mark for streams created afterwards.
pub fn set_default_high_water_mark(object_mode: bool, value: usize) {
    if object_mode {
        DEFAULT_OBJECT_HWM.store(value, Ordering::Relaxed);
    } else {
        DEFAULT_BYTE_HWM.store(value, Ordering::Relaxed);
    }
}

/// Hooks of one stream object. Immutable after construction.
#[derive(Clone, Default)]
pub(crate) struct Hooks {
    pub read: Option<ReadHook>,
    pub write: Option<WriteHook>,
    pub writev: Option<WritevHook>,
    pub final_: Option<FinalHook>,
    pub construct: Option<ConstructHook>,
    pub destroy: Option<DestroyHook>,
}

/// Options of a [`Readable`].
#[derive(Clone)]
pub struct ReadableOptions {
    pub high_water_mark: Option<usize>,
    pub object_mode: bool,
    pub encoding: Option<Encoding>,
    pub emit_close: bool,
    pub auto_destroy: bool,
    pub signal: Option<AbortSignal>,
    pub(crate) hooks: Hooks,
}

impl Default for ReadableOptions {
    fn default() -> Self {
        Self {
            high_water_mark: None,
            object_mode: false,
            encoding: None,
            emit_close: true,
            auto_destroy: true,
            signal: None,
            hooks: Hooks::default(),
        }
    }
}

impl ReadableOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn high_water_mark(mut self, hwm: usize) -> Self {
        self.high_water_mark = Some(hwm);
        self
    }

    pub fn object_mode(mut self, enabled: bool) -> Self {
        self.object_mode = enabled;
        self
    }

    pub fn encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = Some(encoding);
        self
    }

    pub fn emit_close(mut self, enabled: bool) -> Self {
        self.emit_close = enabled;
        self
    }

    pub fn auto_destroy(mut self, enabled: bool) -> Self {
        self.auto_destroy = enabled;
        self
    }

    pub fn signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn read<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Readable, usize) -> StreamResult<()> + Send + Sync + 'static,
    {
        self.hooks.read = Some(Arc::new(hook));
        self
    }

    pub fn construct<F>(mut self, hook: F) -> Self
    where
        F: Fn(Callback) + Send + Sync + 'static,
    {
        self.hooks.construct = Some(Arc::new(hook));
        self
    }

    pub fn destroy<F>(mut self, hook: F) -> Self
    where
        F: Fn(Option<StreamError>, Callback) + Send + Sync + 'static,
    {
        self.hooks.destroy = Some(Arc::new(hook));
        self
    }

    pub(crate) fn resolved_high_water_mark(&self) -> usize {
        self.high_water_mark
            .unwrap_or_else(|| default_high_water_mark(self.object_mode))
    }
}

/// Options of a [`Writable`].
#[derive(Clone)]
pub struct WritableOptions {
    pub high_water_mark: Option<usize>,
    pub object_mode: bool,
    /// Convert text chunks to bytes before they reach the sink.
    pub decode_strings: bool,
    pub default_encoding: Encoding,
    pub emit_close: bool,
    pub auto_destroy: bool,
    pub signal: Option<AbortSignal>,
    pub(crate) hooks: Hooks,
}

impl Default for WritableOptions {
    fn default() -> Self {
        Self {
            high_water_mark: None,
            object_mode: false,
            decode_strings: true,
            default_encoding: Encoding::Utf8,
            emit_close: true,
            auto_destroy: true,
            signal: None,
            hooks: Hooks::default(),
        }
    }
}

impl WritableOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn high_water_mark(mut self, hwm: usize) -> Self {
        self.high_water_mark = Some(hwm);
        self
    }

    pub fn object_mode(mut self, enabled: bool) -> Self {
        self.object_mode = enabled;
        self
    }

    pub fn decode_strings(mut self, enabled: bool) -> Self {
        self.decode_strings = enabled;
        self
    }

    pub fn default_encoding(mut self, encoding: Encoding) -> Self {
        self.default_encoding = encoding;
        self
    }

    pub fn emit_close(mut self, enabled: bool) -> Self {
        self.emit_close = enabled;
        self
    }

    pub fn auto_destroy(mut self, enabled: bool) -> Self {
        self.auto_destroy = enabled;
        self
    }

    pub fn signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn write<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Writable, Chunk, Encoding, Callback) + Send + Sync + 'static,
    {
        self.hooks.write = Some(Arc::new(hook));
        self
    }

    pub fn writev<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Writable, Vec<(Chunk, Encoding)>, Callback) + Send + Sync + 'static,
    {
        self.hooks.writev = Some(Arc::new(hook));
        self
    }

    pub fn final_<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Writable, Callback) + Send + Sync + 'static,
    {
        self.hooks.final_ = Some(Arc::new(hook));
        self
    }

    pub fn construct<F>(mut self, hook: F) -> Self
    where
        F: Fn(Callback) + Send + Sync + 'static,
    {
        self.hooks.construct = Some(Arc::new(hook));
        self
    }

    pub fn destroy<F>(mut self, hook: F) -> Self
    where
        F: Fn(Option<StreamError>, Callback) + Send + Sync + 'static,
    {
        self.hooks.destroy = Some(Arc::new(hook));
        self
    }

    pub(crate) fn resolved_high_water_mark(&self) -> usize {
        self.high_water_mark
            .unwrap_or_else(|| default_high_water_mark(self.object_mode))
    }
}

/// Options of a [`Duplex`](crate::Duplex).
///
/// Per-side settings take precedence over the shared ones.
#[derive(Clone)]
pub struct DuplexOptions {
    pub high_water_mark: Option<usize>,
    pub readable_high_water_mark: Option<usize>,
    pub writable_high_water_mark: Option<usize>,
    pub object_mode: bool,
    pub readable_object_mode: Option<bool>,
    pub writable_object_mode: Option<bool>,
    pub encoding: Option<Encoding>,
    pub decode_strings: bool,
    pub default_encoding: Encoding,
    /// Keep the readable side open after the writable side finishes.
    pub allow_half_open: bool,
    /// `false` creates the stream with its readable side already ended.
    pub readable: bool,
    /// `false` creates the stream with its writable side already finished.
    pub writable: bool,
    pub emit_close: bool,
    pub auto_destroy: bool,
    pub signal: Option<AbortSignal>,
    pub(crate) hooks: Hooks,
}

impl Default for DuplexOptions {
    fn default() -> Self {
        Self {
            high_water_mark: None,
            readable_high_water_mark: None,
            writable_high_water_mark: None,
            object_mode: false,
            readable_object_mode: None,
            writable_object_mode: None,
            encoding: None,
            decode_strings: true,
            default_encoding: Encoding::Utf8,
            allow_half_open: true,
            readable: true,
            writable: true,
            emit_close: true,
            auto_destroy: true,
            signal: None,
            hooks: Hooks::default(),
        }
    }
}

impl DuplexOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn high_water_mark(mut self, hwm: usize) -> Self {
        self.high_water_mark = Some(hwm);
        self
    }

    pub fn readable_high_water_mark(mut self, hwm: usize) -> Self {
        self.readable_high_water_mark = Some(hwm);
        self
    }

    pub fn writable_high_water_mark(mut self, hwm: usize) -> Self {
        self.writable_high_water_mark = Some(hwm);
        self
    }

    pub fn object_mode(mut self, enabled: bool) -> Self {
        self.object_mode = enabled;
        self
    }

    pub fn readable_object_mode(mut self, enabled: bool) -> Self {
        self.readable_object_mode = Some(enabled);
        self
    }

    pub fn writable_object_mode(mut self, enabled: bool) -> Self {
        self.writable_object_mode = Some(enabled);
        self
    }

    pub fn encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = Some(encoding);
        self
    }

    pub fn decode_strings(mut self, enabled: bool) -> Self {
        self.decode_strings = enabled;
        self
    }

    pub fn default_encoding(mut self, encoding: Encoding) -> Self {
        self.default_encoding = encoding;
        self
    }

    pub fn allow_half_open(mut self, enabled: bool) -> Self {
        self.allow_half_open = enabled;
        self
    }

    pub fn readable(mut self, enabled: bool) -> Self {
        self.readable = enabled;
        self
    }

    pub fn writable(mut self, enabled: bool) -> Self {
        self.writable = enabled;
        self
    }

    pub fn emit_close(mut self, enabled: bool) -> Self {
        self.emit_close = enabled;
        self
    }

    pub fn auto_destroy(mut self, enabled: bool) -> Self {
        self.auto_destroy = enabled;
        self
    }

    pub fn signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn read<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Readable, usize) -> StreamResult<()> + Send + Sync + 'static,
    {
        self.hooks.read = Some(Arc::new(hook));
        self
    }

    pub fn write<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Writable, Chunk, Encoding, Callback) + Send + Sync + 'static,
    {
        self.hooks.write = Some(Arc::new(hook));
        self
    }

    pub fn writev<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Writable, Vec<(Chunk, Encoding)>, Callback) + Send + Sync + 'static,
    {
        self.hooks.writev = Some(Arc::new(hook));
        self
    }

    pub fn final_<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Writable, Callback) + Send + Sync + 'static,
    {
        self.hooks.final_ = Some(Arc::new(hook));
        self
    }

    pub fn construct<F>(mut self, hook: F) -> Self
    where
        F: Fn(Callback) + Send + Sync + 'static,
    {
        self.hooks.construct = Some(Arc::new(hook));
        self
    }

    pub fn destroy<F>(mut self, hook: F) -> Self
    where
        F: Fn(Option<StreamError>, Callback) + Send + Sync + 'static,
    {
        self.hooks.destroy = Some(Arc::new(hook));
        self
    }

    pub(crate) fn readable_mode(&self) -> bool {
        self.readable_object_mode.unwrap_or(self.object_mode)
    }

    pub(crate) fn writable_mode(&self) -> bool {
        self.writable_object_mode.unwrap_or(self.object_mode)
    }

    pub(crate) fn readable_hwm(&self) -> usize {
        self.readable_high_water_mark
            .or(self.high_water_mark)
            .unwrap_or_else(|| default_high_water_mark(self.readable_mode()))
    }

    pub(crate) fn writable_hwm(&self) -> usize {
        self.writable_high_water_mark
            .or(self.high_water_mark)
            .unwrap_or_else(|| default_high_water_mark(self.writable_mode()))
    }
}

/// Options of a [`Transform`](crate::Transform).
///
/// Wraps [`DuplexOptions`]; the read, write and final hooks are supplied by
/// the transform machinery itself.
#[derive(Clone, Default)]
pub struct TransformOptions {
    pub duplex: DuplexOptions,
    pub(crate) transform: Option<TransformHook>,
    pub(crate) flush: Option<FlushHook>,
}

impl TransformOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn high_water_mark(mut self, hwm: usize) -> Self {
        self.duplex = self.duplex.high_water_mark(hwm);
        self
    }

    pub fn object_mode(mut self, enabled: bool) -> Self {
        self.duplex = self.duplex.object_mode(enabled);
        self
    }

    pub fn readable_object_mode(mut self, enabled: bool) -> Self {
        self.duplex = self.duplex.readable_object_mode(enabled);
        self
    }

    pub fn writable_object_mode(mut self, enabled: bool) -> Self {
        self.duplex = self.duplex.writable_object_mode(enabled);
        self
    }

    pub fn encoding(mut self, encoding: Encoding) -> Self {
        self.duplex = self.duplex.encoding(encoding);
        self
    }

    pub fn decode_strings(mut self, enabled: bool) -> Self {
        self.duplex = self.duplex.decode_strings(enabled);
        self
    }

    pub fn allow_half_open(mut self, enabled: bool) -> Self {
        self.duplex = self.duplex.allow_half_open(enabled);
        self
    }

    pub fn auto_destroy(mut self, enabled: bool) -> Self {
        self.duplex = self.duplex.auto_destroy(enabled);
        self
    }

    pub fn signal(mut self, signal: AbortSignal) -> Self {
        self.duplex = self.duplex.signal(signal);
        self
    }

    pub fn transform<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Readable, Chunk, Encoding, TransformCallback) + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(hook));
        self
    }

    pub fn flush<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Readable, TransformCallback) + Send + Sync + 'static,
    {
        self.flush = Some(Arc::new(hook));
        self
    }

    pub fn construct<F>(mut self, hook: F) -> Self
    where
        F: Fn(Callback) + Send + Sync + 'static,
    {
        self.duplex = self.duplex.construct(hook);
        self
    }

    pub fn destroy<F>(mut self, hook: F) -> Self
    where
        F: Fn(Option<StreamError>, Callback) + Send + Sync + 'static,
    {
        self.duplex = self.duplex.destroy(hook);
        self
    }
}
