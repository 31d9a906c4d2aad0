//! Duplex streams: one object owning a readable and a writable half.
//!
//! Both halves share the stream's lock, listeners and destroy protocol.
//! With `allow_half_open` off, `finish` on the writable side ends the
//! readable side; ending the readable side never ends the writable side.

use crate::chunk::{Chunk, Encoding};
use crate::destroy;
use crate::error::{StreamError, StreamResult};
use crate::event_loop::EventLoop;
use crate::iter::ReadableIter;
use crate::options::DuplexOptions;
use crate::readable::{self, PipeOptions, Readable};
use crate::state::{ReadableState, WritableState};
use crate::stream::{NodeStream, StreamCore, WritableStream};
use crate::writable::{self, Writable};
use std::sync::Arc;

/// A duplex stream handle. Cloning shares the stream.
#[derive(Debug, Clone)]
pub struct Duplex {
    pub(crate) core: Arc<StreamCore>,
}

impl Duplex {
    /// Create a duplex stream on `event_loop`.
    pub fn new(event_loop: &EventLoop, options: DuplexOptions) -> Self {
        let mut r = ReadableState::new(
            options.readable_mode(),
            options.readable_hwm(),
            options.encoding,
        );
        r.emit_close = options.emit_close;
        r.auto_destroy = options.auto_destroy;
        if !options.readable {
            r.readable = false;
            r.ended = true;
            r.end_emitted = true;
        }

        let mut w = WritableState::new(options.writable_mode(), options.writable_hwm());
        w.decode_strings = options.decode_strings;
        w.default_encoding = options.default_encoding;
        w.emit_close = options.emit_close;
        w.auto_destroy = options.auto_destroy;
        if !options.writable {
            w.writable = false;
            w.ending = true;
            w.ended = true;
            w.finished = true;
        }

        let core = StreamCore::new(event_loop, r, w, options.hooks, options.allow_half_open);
        let stream = Self { core };
        if let Some(signal) = &options.signal {
            crate::abort::add_abort_signal(signal, &stream);
        }
        readable::init_readable(&stream.core);
        writable::init_writable(&stream.core);
        stream
    }

    pub(crate) fn from_core(core: Arc<StreamCore>) -> Self {
        Self { core }
    }

    /// The readable half, sharing this object.
    pub fn readable(&self) -> Readable {
        Readable::from_core(self.core.clone())
    }

    /// The writable half, sharing this object.
    pub fn writable(&self) -> Writable {
        Writable::from_core(self.core.clone())
    }

    pub fn allow_half_open(&self) -> bool {
        self.core.allow_half_open
    }

    pub fn push(&self, chunk: Option<Chunk>) -> bool {
        readable::push(&self.core, chunk, None)
    }

    pub fn push_with(&self, chunk: Chunk, encoding: Encoding) -> bool {
        readable::push(&self.core, Some(chunk), Some(encoding))
    }

    pub fn unshift(&self, chunk: Chunk) -> bool {
        readable::unshift(&self.core, chunk)
    }

    pub fn read(&self, n: Option<usize>) -> Option<Chunk> {
        readable::read(&self.core, n)
    }

    pub fn set_encoding(&self, encoding: Encoding) {
        readable::set_encoding(&self.core, encoding)
    }

    pub fn pause(&self) {
        readable::pause(&self.core)
    }

    pub fn resume(&self) {
        readable::resume(&self.core)
    }

    pub fn is_paused(&self) -> bool {
        readable::is_paused(&self.core)
    }

    pub fn pipe<W: WritableStream + Clone>(&self, dest: &W) -> W {
        self.pipe_with(dest, PipeOptions::default())
    }

    pub fn pipe_with<W: WritableStream + Clone>(&self, dest: &W, options: PipeOptions) -> W {
        readable::pipe(&self.core, dest.core(), options);
        dest.clone()
    }

    pub fn unpipe<W: NodeStream>(&self, dest: &W) {
        readable::unpipe(&self.core, Some(dest.core()))
    }

    pub fn unpipe_all(&self) {
        readable::unpipe(&self.core, None)
    }

    pub fn iter(&self) -> ReadableIter {
        ReadableIter::new(self.core.clone(), true)
    }

    pub fn write(&self, chunk: impl Into<Chunk>) -> StreamResult<bool> {
        writable::write(&self.core, chunk.into(), None, None)
    }

    pub fn write_with<F>(&self, chunk: impl Into<Chunk>, encoding: Option<Encoding>, callback: F) -> StreamResult<bool>
    where
        F: FnOnce(Option<StreamError>) + Send + 'static,
    {
        writable::write(&self.core, chunk.into(), encoding, Some(Box::new(callback)))
    }

    pub fn end(&self) {
        writable::end(&self.core, None, None, None)
    }

    pub fn end_with<F>(&self, chunk: Option<Chunk>, encoding: Option<Encoding>, callback: F)
    where
        F: FnOnce(Option<StreamError>) + Send + 'static,
    {
        writable::end(&self.core, chunk, encoding, Some(Box::new(callback)))
    }

    /// Buffer writes until the matching `uncork`.
    pub fn cork(&self) {
        writable::cork(&self.core)
    }

    /// Undo one `cork`; buffered writes flush once every cork is undone.
    pub fn uncork(&self) {
        writable::uncork(&self.core)
    }

    pub fn readable_length(&self) -> usize {
        self.core.state.lock().r.length()
    }

    pub fn readable_ended(&self) -> bool {
        self.core.state.lock().r.end_emitted
    }

    pub fn readable_high_water_mark(&self) -> usize {
        self.core.state.lock().r.high_water_mark
    }

    pub fn readable_object_mode(&self) -> bool {
        self.core.state.lock().r.object_mode
    }

    pub fn writable_length(&self) -> usize {
        self.core.state.lock().w.length
    }

    pub fn writable_ended(&self) -> bool {
        self.core.state.lock().w.ending
    }

    pub fn writable_finished(&self) -> bool {
        self.core.state.lock().w.finished
    }

    pub fn writable_high_water_mark(&self) -> usize {
        self.core.state.lock().w.high_water_mark
    }

    pub fn writable_object_mode(&self) -> bool {
        self.core.state.lock().w.object_mode
    }

    pub fn is_readable(&self) -> bool {
        self.core.state.lock().r.is_readable()
    }

    pub fn is_writable(&self) -> bool {
        self.core.state.lock().w.is_writable()
    }

    pub fn undestroy(&self) {
        destroy::undestroy(&self.core)
    }
}
