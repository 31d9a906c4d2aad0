//! Writable streams.
//!
//! Writes are handed to the sink hook one at a time; writes arriving while
//! the sink is busy (or corked, or still constructing) are buffered. The
//! return value of [`Writable::write`] tells the producer to back off once
//! the outstanding length reaches the high-water mark, and `drain` signals
//! when to resume.

use crate::chunk::{Chunk, Encoding};
use crate::destroy::{self, error_or_destroy};
use crate::duplex::Duplex;
use crate::error::{StreamError, StreamResult};
use crate::event_loop::EventLoop;
use crate::events::StreamEvent;
use crate::options::{Callback, WritableOptions};
use crate::readable::{self, json_type_name};
use crate::state::{BufferedWrite, Halves, ReadableState, WritableState};
use crate::stream::StreamCore;
use parking_lot::MutexGuard;
use std::sync::Arc;

/// A writable stream handle. Cloning shares the stream.
#[derive(Debug, Clone)]
pub struct Writable {
    pub(crate) core: Arc<StreamCore>,
}

impl Writable {
    /// Create a writable stream on `event_loop`.
    pub fn new(event_loop: &EventLoop, options: WritableOptions) -> Self {
        let mut w = WritableState::new(options.object_mode, options.resolved_high_water_mark());
        w.decode_strings = options.decode_strings;
        w.default_encoding = options.default_encoding;
        w.emit_close = options.emit_close;
        w.auto_destroy = options.auto_destroy;

        let core = StreamCore::new(event_loop, ReadableState::absent(), w, options.hooks, true);
        let stream = Self { core };
        if let Some(signal) = &options.signal {
            crate::abort::add_abort_signal(signal, &stream);
        }
        init_writable(&stream.core);
        stream
    }

    pub(crate) fn from_core(core: Arc<StreamCore>) -> Self {
        Self { core }
    }

    /// The whole stream, when this is the writable side of a duplex.
    pub fn as_duplex(&self) -> Option<Duplex> {
        self.core
            .is_readable_stream()
            .then(|| Duplex::from_core(self.core.clone()))
    }

    /// Write a chunk.
    ///
    /// `Ok(false)` means the caller should wait for `drain`. `Err` is
    /// returned only for invalid chunks, which leave the stream untouched.
    pub fn write(&self, chunk: impl Into<Chunk>) -> StreamResult<bool> {
        write(&self.core, chunk.into(), None, None)
    }

    /// Write with an explicit encoding and a completion callback.
    pub fn write_with<F>(&self, chunk: impl Into<Chunk>, encoding: Option<Encoding>, callback: F) -> StreamResult<bool>
    where
        F: FnOnce(Option<StreamError>) + Send + 'static,
    {
        write(&self.core, chunk.into(), encoding, Some(Box::new(callback)))
    }

    /// Signal that no more data will be written.
    pub fn end(&self) {
        end(&self.core, None, None, None)
    }

    /// Write a final chunk (if any) and end; `callback` runs on `finish`
    /// or with the error that prevented it.
    pub fn end_with<F>(&self, chunk: Option<Chunk>, encoding: Option<Encoding>, callback: F)
    where
        F: FnOnce(Option<StreamError>) + Send + 'static,
    {
        end(&self.core, chunk, encoding, Some(Box::new(callback)))
    }

    /// Buffer writes until the matching [`uncork`](Self::uncork).
    pub fn cork(&self) {
        cork(&self.core)
    }

    /// Undo one `cork`; buffered writes flush once every cork is undone.
    pub fn uncork(&self) {
        uncork(&self.core)
    }

    pub fn set_default_encoding(&self, encoding: Encoding) {
        self.core.state.lock().w.default_encoding = encoding;
    }

    pub fn writable_length(&self) -> usize {
        self.core.state.lock().w.length
    }

    pub fn writable_need_drain(&self) -> bool {
        let state = self.core.state.lock();
        !state.w.destroyed && !state.w.ending && state.w.need_drain
    }

    pub fn writable_corked(&self) -> u32 {
        self.core.state.lock().w.corked
    }

    /// `end()` was called.
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

    /// Whether `write` would currently be accepted.
    pub fn is_writable(&self) -> bool {
        self.core.state.lock().w.is_writable()
    }
}

/// Run the construct hook; writes buffered meanwhile are flushed after.
pub(crate) fn init_writable(core: &Arc<StreamCore>) {
    let c = core.clone();
    destroy::construct(
        core,
        Box::new(move || {
            let writing = c.state.lock().w.writing;
            if !writing {
                clear_buffer(&c);
            }
            finish_maybe(&c, false);
        }),
    );
}

/// Why a write was not accepted.
enum WriteRejection {
    /// Bad argument; nothing happened.
    Invalid(StreamError),
    /// The stream already ended or was destroyed; the error was reported.
    Failed(StreamError),
}

pub(crate) fn write(
    core: &Arc<StreamCore>,
    chunk: Chunk,
    encoding: Option<Encoding>,
    callback: Option<Callback>,
) -> StreamResult<bool> {
    match write_chunk(core, chunk, encoding, callback) {
        Ok(ret) => Ok(ret),
        Err(WriteRejection::Invalid(err)) => Err(err),
        Err(WriteRejection::Failed(_)) => Ok(false),
    }
}

fn write_chunk(
    core: &Arc<StreamCore>,
    chunk: Chunk,
    encoding: Option<Encoding>,
    callback: Option<Callback>,
) -> Result<bool, WriteRejection> {
    let mut state = core.state.lock();
    let w = &mut state.w;
    if chunk.is_null() {
        return Err(WriteRejection::Invalid(StreamError::NullValues));
    }

    let (chunk, encoding) = if w.object_mode {
        (chunk, encoding.unwrap_or(w.default_encoding))
    } else {
        match chunk {
            Chunk::Text(text) => {
                let encoding = encoding.unwrap_or(w.default_encoding);
                if w.decode_strings {
                    let bytes = encoding.encode(&text).map_err(WriteRejection::Invalid)?;
                    (Chunk::Bytes(bytes), Encoding::Buffer)
                } else {
                    (Chunk::Text(text), encoding)
                }
            }
            Chunk::Bytes(bytes) => (Chunk::Bytes(bytes), Encoding::Buffer),
            Chunk::Value(value) => {
                return Err(WriteRejection::Invalid(StreamError::InvalidArgType(format!(
                    "The \"chunk\" argument must be of type string or Buffer. Received {}",
                    json_type_name(&value)
                ))));
            }
        }
    };

    let failure = if w.ending {
        Some(StreamError::WriteAfterEnd)
    } else if w.destroyed {
        Some(StreamError::Destroyed("write"))
    } else {
        None
    };
    if let Some(err) = failure {
        drop(state);
        tracing::debug!(stream_id = %core.id, error = %err, "Write rejected");
        error_or_destroy(core, err.clone(), true);
        if let Some(callback) = callback {
            let e = err.clone();
            core.event_loop.next_tick(move || callback(Some(e)));
        }
        return Err(WriteRejection::Failed(err));
    }

    w.pending_cb += 1;
    Ok(write_or_buffer(core, state, chunk, encoding, callback))
}

fn nop_callback() -> Callback {
    Box::new(|_| {})
}

fn write_or_buffer(
    core: &Arc<StreamCore>,
    mut state: MutexGuard<'_, Halves>,
    chunk: Chunk,
    encoding: Encoding,
    callback: Option<Callback>,
) -> bool {
    let w = &mut state.w;
    let len = chunk.len_in(w.object_mode);
    w.length += len;
    let ret = w.length < w.high_water_mark;
    if !ret {
        w.need_drain = true;
    }

    if w.writing || w.corked > 0 || w.errored.is_some() || !w.constructed {
        w.buffered.push_back(BufferedWrite {
            chunk,
            encoding,
            callback,
        });
        drop(state);
    } else {
        drop(state);
        do_write(
            core,
            WritePayload::One(chunk, encoding),
            len,
            callback.unwrap_or_else(nop_callback),
        );
    }

    let state = core.state.lock();
    ret && state.w.errored.is_none() && !state.w.destroyed
}

enum WritePayload {
    One(Chunk, Encoding),
    Many(Vec<(Chunk, Encoding)>),
}

fn do_write(core: &Arc<StreamCore>, payload: WritePayload, len: usize, callback: Callback) {
    let destroyed = {
        let mut state = core.state.lock();
        let w = &mut state.w;
        w.write_len = len;
        w.write_cb = Some(callback);
        w.writing = true;
        w.sync = true;
        w.destroyed
    };

    if destroyed {
        on_write(core, Some(StreamError::Destroyed("write")));
    } else {
        let stream = Writable::from_core(core.clone());
        let c = core.clone();
        let onwrite: Callback = Box::new(move |err| on_write(&c, err));
        let hooks = &core.hooks;
        match payload {
            WritePayload::Many(chunks) => match &hooks.writev {
                Some(hook) => hook(&stream, chunks, onwrite),
                None => onwrite(Some(StreamError::MethodNotImplemented("_writev"))),
            },
            WritePayload::One(chunk, encoding) => match (&hooks.write, &hooks.writev) {
                (Some(hook), _) => hook(&stream, chunk, encoding, onwrite),
                (None, Some(hook)) => hook(&stream, vec![(chunk, encoding)], onwrite),
                (None, None) => onwrite(Some(StreamError::MethodNotImplemented("_write"))),
            },
        }
    }

    core.state.lock().w.sync = false;
}

fn on_write(core: &Arc<StreamCore>, error: Option<StreamError>) {
    let mut state = core.state.lock();
    let Some(callback) = state.w.write_cb.take() else {
        tracing::warn!(stream_id = %core.id, "Write completion without a pending write");
        return;
    };
    let sync = state.w.sync;
    state.w.writing = false;
    state.w.length = state.w.length.saturating_sub(state.w.write_len);
    state.w.write_len = 0;

    if let Some(err) = error {
        state.record_error(Some(&err));
        drop(state);
        tracing::debug!(stream_id = %core.id, error = %err, "Write failed");
        if sync {
            let c = core.clone();
            core.event_loop
                .next_tick(move || on_write_error(&c, callback, err));
        } else {
            on_write_error(core, callback, err);
        }
        return;
    }

    let has_buffered = !state.w.buffered.is_empty();
    drop(state);
    if has_buffered {
        clear_buffer(core);
    }

    if sync {
        let first = {
            let mut state = core.state.lock();
            state.w.after_write.push(callback);
            state.w.after_write.len() == 1
        };
        if first {
            let c = core.clone();
            core.event_loop.next_tick(move || {
                let callbacks = std::mem::take(&mut c.state.lock().w.after_write);
                after_write(&c, callbacks);
            });
        }
    } else {
        after_write(core, vec![callback]);
    }
}

fn on_write_error(core: &Arc<StreamCore>, callback: Callback, error: StreamError) {
    {
        let mut state = core.state.lock();
        state.w.pending_cb = state.w.pending_cb.saturating_sub(1);
    }
    callback(Some(error.clone()));
    error_buffer(core);
    error_or_destroy(core, error, false);
}

fn after_write(core: &Arc<StreamCore>, callbacks: Vec<Callback>) {
    let need_drain = {
        let mut state = core.state.lock();
        let w = &mut state.w;
        let need_drain = !w.ending && !w.destroyed && w.length == 0 && w.need_drain;
        if need_drain {
            w.need_drain = false;
        }
        need_drain
    };
    if need_drain {
        core.emit(StreamEvent::Drain);
    }

    for callback in callbacks {
        {
            let mut state = core.state.lock();
            state.w.pending_cb = state.w.pending_cb.saturating_sub(1);
        }
        callback(None);
    }

    if core.state.lock().w.destroyed {
        error_buffer(core);
    }
    finish_maybe(core, false);
}

/// Fail every buffered write and pending `end` callback after the stream
/// errored or was destroyed.
pub(crate) fn error_buffer(core: &Arc<StreamCore>) {
    let (callbacks, finish_callbacks, write_error, end_error) = {
        let mut state = core.state.lock();
        let w = &mut state.w;
        if w.writing {
            return;
        }
        let mut callbacks = Vec::new();
        while let Some(buffered) = w.buffered.pop_front() {
            w.length = w.length.saturating_sub(buffered.chunk.len_in(w.object_mode));
            if let Some(callback) = buffered.callback {
                callbacks.push(callback);
            }
        }
        (
            callbacks,
            std::mem::take(&mut w.on_finished),
            w.errored.clone().unwrap_or(StreamError::Destroyed("write")),
            w.errored.clone().unwrap_or(StreamError::Destroyed("end")),
        )
    };
    for callback in callbacks {
        callback(Some(write_error.clone()));
    }
    for callback in finish_callbacks {
        callback(Some(end_error.clone()));
    }
}

/// Dispatch buffered writes, batching through `writev` when possible.
fn clear_buffer(core: &Arc<StreamCore>) {
    let mut state = core.state.lock();
    {
        let w = &state.w;
        if w.corked > 0
            || w.buffer_processing
            || w.destroyed
            || !w.constructed
            || w.buffered.is_empty()
        {
            return;
        }
    }
    state.w.buffer_processing = true;

    if state.w.buffered.len() > 1 && core.hooks.writev.is_some() {
        let w = &mut state.w;
        let count = w.buffered.len();
        w.pending_cb = w.pending_cb.saturating_sub(count - 1);
        let len = w.length;
        let mut chunks = Vec::with_capacity(count);
        let mut callbacks = Vec::with_capacity(count);
        for buffered in w.buffered.drain(..) {
            chunks.push((buffered.chunk, buffered.encoding));
            callbacks.push(buffered.callback);
        }
        drop(state);
        tracing::trace!(stream_id = %core.id, count, "Flushing buffered writes through writev");

        let callback: Callback = Box::new(move |err| {
            for callback in callbacks.into_iter().flatten() {
                callback(err.clone());
            }
        });
        do_write(core, WritePayload::Many(chunks), len, callback);
    } else {
        loop {
            let Some(buffered) = state.w.buffered.pop_front() else {
                break;
            };
            let len = buffered.chunk.len_in(state.w.object_mode);
            drop(state);
            do_write(
                core,
                WritePayload::One(buffered.chunk, buffered.encoding),
                len,
                buffered.callback.unwrap_or_else(nop_callback),
            );
            state = core.state.lock();
            if state.w.writing {
                break;
            }
        }
        drop(state);
    }

    core.state.lock().w.buffer_processing = false;
}

pub(crate) fn cork(core: &Arc<StreamCore>) {
    core.state.lock().w.corked += 1;
}

pub(crate) fn uncork(core: &Arc<StreamCore>) {
    let flush = {
        let mut state = core.state.lock();
        let w = &mut state.w;
        if w.corked > 0 {
            w.corked -= 1;
            !w.writing
        } else {
            false
        }
    };
    if flush {
        clear_buffer(core);
    }
}

pub(crate) fn end(
    core: &Arc<StreamCore>,
    chunk: Option<Chunk>,
    encoding: Option<Encoding>,
    callback: Option<Callback>,
) {
    let mut error = None;
    if let Some(chunk) = chunk {
        match write_chunk(core, chunk, encoding, None) {
            Ok(_) => {}
            Err(WriteRejection::Invalid(err)) | Err(WriteRejection::Failed(err)) => error = Some(err),
        }
    }

    let uncork_now = {
        let mut state = core.state.lock();
        if state.w.corked > 0 {
            state.w.corked = 1;
            true
        } else {
            false
        }
    };
    if uncork_now {
        uncork(core);
    }

    let mut state = core.state.lock();
    if error.is_none() {
        if state.w.errored.is_none() && !state.w.ending {
            state.w.ending = true;
            drop(state);
            tracing::trace!(stream_id = %core.id, "Writable ending");
            finish_maybe(core, true);
            state = core.state.lock();
            state.w.ended = true;
        } else if state.w.finished {
            error = Some(StreamError::AlreadyFinished("end"));
        } else if state.w.destroyed {
            error = Some(StreamError::Destroyed("end"));
        } else if state.w.ending {
            error = Some(StreamError::WriteAfterEnd);
        }
    }

    if let Some(callback) = callback {
        if error.is_some() || state.w.finished {
            drop(state);
            core.event_loop.next_tick(move || callback(error));
        } else {
            state.w.on_finished.push(callback);
        }
    }
}

fn prefinish(core: &Arc<StreamCore>) {
    enum Action {
        CallFinal,
        Emit,
    }
    let action = {
        let mut state = core.state.lock();
        let w = &mut state.w;
        if w.prefinished || w.final_called {
            return;
        }
        if core.hooks.final_.is_some() && !w.destroyed {
            w.final_called = true;
            Action::CallFinal
        } else {
            w.prefinished = true;
            Action::Emit
        }
    };
    match action {
        Action::CallFinal => call_final(core),
        Action::Emit => {
            core.emit(StreamEvent::Prefinish);
        }
    }
}

fn call_final(core: &Arc<StreamCore>) {
    let Some(hook) = core.hooks.final_.clone() else {
        return;
    };
    {
        let mut state = core.state.lock();
        state.w.sync = true;
        state.w.pending_cb += 1;
    }
    let c = core.clone();
    hook(
        &Writable::from_core(core.clone()),
        Box::new(move |err| on_final(&c, err)),
    );
    core.state.lock().w.sync = false;
}

fn on_final(core: &Arc<StreamCore>, error: Option<StreamError>) {
    let mut state = core.state.lock();
    state.w.pending_cb = state.w.pending_cb.saturating_sub(1);

    if let Some(err) = error {
        let callbacks = std::mem::take(&mut state.w.on_finished);
        let sync = state.w.sync;
        drop(state);
        tracing::debug!(stream_id = %core.id, error = %err, "Final hook failed");
        for callback in callbacks {
            callback(Some(err.clone()));
        }
        error_or_destroy(core, err, sync);
    } else if state.w.need_finish() {
        state.w.prefinished = true;
        state.w.pending_cb += 1;
        drop(state);
        core.emit(StreamEvent::Prefinish);
        let c = core.clone();
        core.event_loop.next_tick(move || finish(&c));
    }
}

fn finish_maybe(core: &Arc<StreamCore>, sync: bool) {
    if !core.state.lock().w.need_finish() {
        return;
    }
    prefinish(core);

    let mut state = core.state.lock();
    if state.w.pending_cb != 0 {
        return;
    }
    if sync {
        state.w.pending_cb += 1;
        drop(state);
        let c = core.clone();
        core.event_loop.next_tick(move || {
            let ready = {
                let mut state = c.state.lock();
                if state.w.need_finish() {
                    true
                } else {
                    state.w.pending_cb = state.w.pending_cb.saturating_sub(1);
                    false
                }
            };
            if ready {
                finish(&c);
            }
        });
    } else if state.w.need_finish() {
        state.w.pending_cb += 1;
        drop(state);
        finish(core);
    }
}

fn finish(core: &Arc<StreamCore>) {
    let callbacks = {
        let mut state = core.state.lock();
        state.w.pending_cb = state.w.pending_cb.saturating_sub(1);
        state.w.finished = true;
        std::mem::take(&mut state.w.on_finished)
    };
    tracing::trace!(stream_id = %core.id, "Writable finished");
    for callback in callbacks {
        callback(None);
    }
    core.emit(StreamEvent::Finish);

    let (end_readable, destroy_now) = {
        let state = core.state.lock();
        let end_readable = state.r.present && !core.allow_half_open && !state.r.ended;
        let destroy_now = state.w.auto_destroy
            && (!state.r.present
                || (state.r.auto_destroy && (state.r.end_emitted || !state.r.readable)));
        (end_readable, destroy_now)
    };
    if end_readable {
        let c = core.clone();
        core.event_loop.next_tick(move || {
            readable::push(&c, None, None);
        });
    }
    if destroy_now {
        destroy::destroy(core, None, None);
    }
}
