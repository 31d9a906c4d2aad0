//! Readable streams.
//!
//! A readable buffers chunks handed to [`Readable::push`] by its producer
//! (the read hook) and delivers them to consumers in one of two modes:
//!
//! - **flowing**: chunks are emitted as `data` events as soon as possible;
//!   entered by adding a `data` listener, calling `resume()` or `pipe()`.
//! - **paused**: consumers call [`Readable::read`], usually from a
//!   `readable` listener.
//!
//! The producer is asked for more (`read` hook) whenever the buffer falls
//! below the high-water mark, and `push` reports whether it should keep
//! going.

use crate::chunk::{Chunk, Encoding};
use crate::decoder::StringDecoder;
use crate::destroy::{self, error_or_destroy};
use crate::duplex::Duplex;
use crate::error::StreamError;
use crate::event_loop::EventLoop;
use crate::events::{EventKind, ListenerId, StreamEvent};
use crate::iter::ReadableIter;
use crate::options::ReadableOptions;
use crate::state::{ReadableState, WritableState};
use crate::stream::{NodeStream, StreamCore, WritableStream};
use crate::writable;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// Largest high-water mark a `read(n)` request may grow the buffer to.
const MAX_HWM: usize = 0x4000_0000;

/// A readable stream handle. Cloning shares the stream.
#[derive(Debug, Clone)]
pub struct Readable {
    pub(crate) core: Arc<StreamCore>,
}

/// Options of [`Readable::pipe_with`].
#[derive(Debug, Clone, Copy)]
pub struct PipeOptions {
    /// End the destination when the source ends.
    pub end: bool,
}

impl Default for PipeOptions {
    fn default() -> Self {
        Self { end: true }
    }
}

impl Readable {
    /// Create a readable stream on `event_loop`.
    pub fn new(event_loop: &EventLoop, options: ReadableOptions) -> Self {
        let mut r = ReadableState::new(
            options.object_mode,
            options.resolved_high_water_mark(),
            options.encoding,
        );
        r.emit_close = options.emit_close;
        r.auto_destroy = options.auto_destroy;

        let core = StreamCore::new(event_loop, r, WritableState::absent(), options.hooks, true);
        let stream = Self { core };
        if let Some(signal) = &options.signal {
            crate::abort::add_abort_signal(signal, &stream);
        }
        init_readable(&stream.core);
        stream
    }

    pub(crate) fn from_core(core: Arc<StreamCore>) -> Self {
        Self { core }
    }

    /// The whole stream, when this is the readable side of a duplex.
    pub fn as_duplex(&self) -> Option<Duplex> {
        self.core
            .is_writable_stream()
            .then(|| Duplex::from_core(self.core.clone()))
    }

    /// Queue a chunk for consumers; `None` signals end-of-data.
    ///
    /// Returns whether the producer should keep pushing.
    pub fn push(&self, chunk: Option<Chunk>) -> bool {
        push(&self.core, chunk, None)
    }

    /// Push a text chunk given in `encoding`.
    pub fn push_with(&self, chunk: Chunk, encoding: Encoding) -> bool {
        push(&self.core, Some(chunk), Some(encoding))
    }

    /// Put a chunk back at the head of the buffer.
    pub fn unshift(&self, chunk: Chunk) -> bool {
        unshift(&self.core, chunk)
    }

    /// Pull data out of the buffer.
    ///
    /// `None` takes whatever is available, `Some(0)` only primes the
    /// producer.
    pub fn read(&self, n: Option<usize>) -> Option<Chunk> {
        read(&self.core, n)
    }

    /// Decode buffered and future bytes as text in `encoding`.
    pub fn set_encoding(&self, encoding: Encoding) {
        set_encoding(&self.core, encoding)
    }

    /// Stop flowing; data stays buffered until `read` or `resume`.
    pub fn pause(&self) {
        pause(&self.core)
    }

    /// Switch to flowing mode on the next tick.
    pub fn resume(&self) {
        resume(&self.core)
    }

    /// Whether the stream was paused and is not flowing.
    pub fn is_paused(&self) -> bool {
        is_paused(&self.core)
    }

    /// Forward everything to `dest`, ending it when this stream ends.
    pub fn pipe<W: WritableStream + Clone>(&self, dest: &W) -> W {
        self.pipe_with(dest, PipeOptions::default())
    }

    pub fn pipe_with<W: WritableStream + Clone>(&self, dest: &W, options: PipeOptions) -> W {
        pipe(&self.core, dest.core(), options);
        dest.clone()
    }

    /// Detach `dest`.
    pub fn unpipe<W: NodeStream>(&self, dest: &W) {
        unpipe(&self.core, Some(dest.core()))
    }

    /// Detach every destination.
    pub fn unpipe_all(&self) {
        unpipe(&self.core, None)
    }

    /// Consume the stream as an async sequence of chunks.
    pub fn iter(&self) -> ReadableIter {
        ReadableIter::new(self.core.clone(), true)
    }

    /// Like [`iter`](Self::iter); with `destroy_on_return = false` an early
    /// drop leaves the stream alive.
    pub fn iter_with(&self, destroy_on_return: bool) -> ReadableIter {
        ReadableIter::new(self.core.clone(), destroy_on_return)
    }

    pub fn readable_length(&self) -> usize {
        self.core.state.lock().r.length()
    }

    pub fn readable_high_water_mark(&self) -> usize {
        self.core.state.lock().r.high_water_mark
    }

    pub fn readable_object_mode(&self) -> bool {
        self.core.state.lock().r.object_mode
    }

    pub fn readable_ended(&self) -> bool {
        self.core.state.lock().r.end_emitted
    }

    pub fn readable_flowing(&self) -> Option<bool> {
        self.core.state.lock().r.flowing
    }

    pub fn readable_encoding(&self) -> Option<Encoding> {
        self.core.state.lock().r.encoding
    }

    /// Whether the stream can still be read from.
    pub fn is_readable(&self) -> bool {
        self.core.state.lock().r.is_readable()
    }

    /// Data was consumed, or the stream was aborted before its end.
    pub fn is_disturbed(&self) -> bool {
        let state = self.core.state.lock();
        let r = &state.r;
        r.data_emitted || ((r.destroyed || r.errored.is_some()) && !r.end_emitted)
    }

    /// Reset the teardown flags so the stream can be reused.
    pub fn undestroy(&self) {
        destroy::undestroy(&self.core)
    }
}

/// Run the construct hook; a read requested meanwhile is replayed after.
pub(crate) fn init_readable(core: &Arc<StreamCore>) {
    let c = core.clone();
    destroy::construct(
        core,
        Box::new(move || {
            if c.state.lock().r.need_readable {
                maybe_read_more(&c);
            }
        }),
    );
}

/// Outcome of normalizing a chunk under the lock.
enum AddOutcome {
    Error(StreamError),
    Eof { emit_now: bool },
    Add { chunk: Chunk, front: bool },
    ReadMore,
    Rejected,
    Nothing,
}

pub(crate) fn push(core: &Arc<StreamCore>, chunk: Option<Chunk>, encoding: Option<Encoding>) -> bool {
    add_chunk_entry(core, chunk, encoding, false)
}

pub(crate) fn unshift(core: &Arc<StreamCore>, chunk: Chunk) -> bool {
    add_chunk_entry(core, Some(chunk), None, true)
}

fn add_chunk_entry(
    core: &Arc<StreamCore>,
    chunk: Option<Chunk>,
    encoding: Option<Encoding>,
    add_to_front: bool,
) -> bool {
    let outcome = {
        let mut state = core.state.lock();
        let r = &mut state.r;
        match normalize_chunk(r, chunk.filter(|c| !c.is_null()), encoding, add_to_front) {
            Err(err) => AddOutcome::Error(err),
            Ok(None) => {
                r.reading = false;
                AddOutcome::Eof {
                    emit_now: on_eof_chunk(core, r),
                }
            }
            Ok(Some((chunk, already_decoded))) => {
                if r.object_mode || !chunk.is_empty() {
                    if add_to_front {
                        if r.end_emitted {
                            AddOutcome::Error(StreamError::UnshiftAfterEnd)
                        } else if r.destroyed || r.errored.is_some() {
                            AddOutcome::Rejected
                        } else {
                            AddOutcome::Add { chunk, front: true }
                        }
                    } else if r.ended {
                        AddOutcome::Error(StreamError::PushAfterEof)
                    } else if r.destroyed || r.errored.is_some() {
                        AddOutcome::Rejected
                    } else {
                        r.reading = false;
                        let decoded = match (&chunk, already_decoded, r.decoder.as_mut()) {
                            (Chunk::Bytes(bytes), false, Some(decoder)) => Some(decoder.write(bytes)),
                            _ => None,
                        };
                        match decoded {
                            Some(text) if text.is_empty() && !r.object_mode => AddOutcome::ReadMore,
                            Some(text) => AddOutcome::Add {
                                chunk: Chunk::Text(text),
                                front: false,
                            },
                            None => AddOutcome::Add { chunk, front: false },
                        }
                    }
                } else if !add_to_front {
                    r.reading = false;
                    AddOutcome::ReadMore
                } else {
                    AddOutcome::Nothing
                }
            }
        }
    };

    match outcome {
        AddOutcome::Error(err) => error_or_destroy(core, err, false),
        AddOutcome::Eof { emit_now } => {
            if emit_now {
                emit_readable_nt(core);
            }
        }
        AddOutcome::Add { chunk, front } => add_chunk(core, chunk, front),
        AddOutcome::ReadMore => maybe_read_more(core),
        AddOutcome::Rejected => return false,
        AddOutcome::Nothing => {}
    }

    let state = core.state.lock();
    let r = &state.r;
    !r.ended && (r.length() < r.high_water_mark || r.length() == 0)
}

/// Convert a pushed chunk to the form stored in the buffer. The flag says
/// whether the chunk is already text in the stream's own encoding.
fn normalize_chunk(
    r: &ReadableState,
    chunk: Option<Chunk>,
    encoding: Option<Encoding>,
    add_to_front: bool,
) -> Result<Option<(Chunk, bool)>, StreamError> {
    let Some(chunk) = chunk else {
        return Ok(None);
    };
    if r.object_mode {
        return Ok(Some((chunk, false)));
    }
    match chunk {
        Chunk::Text(text) => {
            let encoding = encoding.unwrap_or(r.default_encoding);
            if r.encoding == Some(encoding) {
                return Ok(Some((Chunk::Text(text), true)));
            }
            let bytes = encoding.encode(&text)?;
            match r.encoding {
                Some(own) if add_to_front => Ok(Some((Chunk::Text(own.decode(&bytes)), true))),
                _ => Ok(Some((Chunk::Bytes(bytes), false))),
            }
        }
        Chunk::Bytes(bytes) => Ok(Some((Chunk::Bytes(bytes), false))),
        Chunk::Value(value) => Err(StreamError::InvalidArgType(format!(
            "The \"chunk\" argument must be of type string or Buffer. Received {}",
            json_type_name(&value)
        ))),
    }
}

pub(crate) fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "an instance of Array",
        serde_json::Value::Object(_) => "an instance of Object",
    }
}

fn add_chunk(core: &Arc<StreamCore>, chunk: Chunk, add_to_front: bool) {
    let direct = {
        let mut state = core.state.lock();
        let r = &mut state.r;
        if r.flowing == Some(true)
            && r.length() == 0
            && !r.sync
            && core.emitter.listener_count(EventKind::Data) > 0
        {
            r.await_drain.clear();
            r.data_emitted = true;
            Some(chunk)
        } else {
            if add_to_front {
                r.buffer.unshift(chunk);
            } else {
                r.buffer.push(chunk);
            }
            if r.need_readable {
                emit_readable(core, r);
            }
            None
        }
    };
    if let Some(chunk) = direct {
        core.emit(StreamEvent::Data(chunk));
    }
    maybe_read_more(core);
}

/// Mark end-of-data. Returns true when `readable` must be emitted right
/// away, outside the lock.
fn on_eof_chunk(core: &Arc<StreamCore>, r: &mut ReadableState) -> bool {
    if r.ended {
        return false;
    }
    if let Some(decoder) = r.decoder.as_mut() {
        let rest = decoder.end();
        if !rest.is_empty() {
            r.buffer.push(Chunk::Text(rest));
        }
    }
    r.ended = true;
    tracing::trace!(stream_id = %core.id, "Readable reached end of data");

    if r.sync {
        emit_readable(core, r);
        false
    } else {
        r.need_readable = false;
        r.emitted_readable = true;
        true
    }
}

fn emit_readable(core: &Arc<StreamCore>, r: &mut ReadableState) {
    r.need_readable = false;
    if !r.emitted_readable {
        r.emitted_readable = true;
        let c = core.clone();
        core.event_loop.next_tick(move || emit_readable_nt(&c));
    }
}

fn emit_readable_nt(core: &Arc<StreamCore>) {
    let emit = {
        let state = core.state.lock();
        let r = &state.r;
        !r.destroyed && r.errored.is_none() && (r.length() > 0 || r.ended)
    };
    if emit {
        core.emit(StreamEvent::Readable);
        core.state.lock().r.emitted_readable = false;
    }
    {
        let mut state = core.state.lock();
        let r = &mut state.r;
        r.need_readable =
            r.flowing != Some(true) && !r.ended && r.length() <= r.high_water_mark;
    }
    flow(core);
}

fn flow(core: &Arc<StreamCore>) {
    while core.state.lock().r.flowing == Some(true) && read(core, None).is_some() {}
}

fn maybe_read_more(core: &Arc<StreamCore>) {
    let schedule = {
        let mut state = core.state.lock();
        let r = &mut state.r;
        if !r.reading_more && r.constructed {
            r.reading_more = true;
            true
        } else {
            false
        }
    };
    if schedule {
        let c = core.clone();
        core.event_loop.next_tick(move || maybe_read_more_nt(&c));
    }
}

fn maybe_read_more_nt(core: &Arc<StreamCore>) {
    loop {
        let len = {
            let state = core.state.lock();
            let r = &state.r;
            let wants_more = !r.reading
                && !r.ended
                && (r.length() < r.high_water_mark
                    || (r.flowing == Some(true) && r.length() == 0));
            if !wants_more {
                break;
            }
            r.length()
        };
        read(core, Some(0));
        if len == core.state.lock().r.length() {
            break;
        }
    }
    core.state.lock().r.reading_more = false;
}

fn compute_new_high_water_mark(n: usize) -> usize {
    n.min(MAX_HWM).next_power_of_two()
}

fn how_much_to_read(n: Option<usize>, r: &ReadableState) -> usize {
    if n == Some(0) || (r.length() == 0 && r.ended) {
        return 0;
    }
    if r.object_mode {
        return 1;
    }
    match n {
        None => {
            if r.flowing == Some(true) && r.length() > 0 {
                r.buffer.first().map(Chunk::byte_mode_len).unwrap_or(0)
            } else {
                r.length()
            }
        }
        Some(n) if n <= r.length() => n,
        Some(_) => {
            if r.ended {
                r.length()
            } else {
                0
            }
        }
    }
}

fn from_list(n: usize, r: &mut ReadableState) -> Option<Chunk> {
    if r.length() == 0 {
        return None;
    }
    if r.object_mode {
        return r.buffer.shift();
    }
    if n == 0 || n >= r.length() {
        let ret = if r.decoder.is_some() {
            Chunk::Text(r.buffer.join(""))
        } else if r.buffer.count() == 1 {
            r.buffer.first().cloned()?
        } else {
            Chunk::Bytes(r.buffer.concat(r.length()))
        };
        r.buffer.clear();
        return Some(ret);
    }
    r.buffer.consume(n, r.decoder.is_some())
}

pub(crate) fn read(core: &Arc<StreamCore>, n_orig: Option<usize>) -> Option<Chunk> {
    let mut state = core.state.lock();
    {
        let r = &mut state.r;
        if let Some(n) = n_orig
            && n > r.high_water_mark
        {
            r.high_water_mark = compute_new_high_water_mark(n);
        }
        if n_orig != Some(0) {
            r.emitted_readable = false;
        }

        if n_orig == Some(0) && r.need_readable {
            let enough = if r.high_water_mark != 0 {
                r.length() >= r.high_water_mark
            } else {
                r.length() > 0
            };
            if enough || r.ended {
                if r.length() == 0 && r.ended {
                    end_readable(core, r);
                } else {
                    emit_readable(core, r);
                }
                return None;
            }
        }
    }

    let mut n = how_much_to_read(n_orig, &state.r);
    if n == 0 && state.r.ended {
        if state.r.length() == 0 {
            end_readable(core, &mut state.r);
        }
        return None;
    }

    let r = &mut state.r;
    let mut do_read = r.need_readable;
    if r.length() == 0 || r.length() - n < r.high_water_mark {
        do_read = true;
    }
    if r.ended || r.reading || r.destroyed || r.errored.is_some() || !r.constructed {
        do_read = false;
    } else if do_read {
        r.reading = true;
        r.sync = true;
        if r.length() == 0 {
            r.need_readable = true;
        }
        let size = r.high_water_mark;
        drop(state);

        let result = match core.hooks.read.clone() {
            Some(hook) => hook(&Readable::from_core(core.clone()), size),
            None => Err(StreamError::MethodNotImplemented("_read")),
        };
        if let Err(err) = result {
            tracing::debug!(stream_id = %core.id, error = %err, "Read hook failed");
            error_or_destroy(core, err, false);
        }

        state = core.state.lock();
        state.r.sync = false;
        if !state.r.reading {
            n = how_much_to_read(n_orig, &state.r);
        }
    }

    let r = &mut state.r;
    let ret = if n > 0 { from_list(n, r) } else { None };
    if ret.is_none() {
        r.need_readable = r.length() <= r.high_water_mark;
        n = 0;
    } else {
        r.await_drain.clear();
    }

    if r.length() == 0 {
        if !r.ended {
            r.need_readable = true;
        }
        if n_orig != Some(n) && r.ended {
            end_readable(core, r);
        }
    }

    let emit = ret.is_some() && !r.error_emitted && !r.close_emitted;
    if emit {
        r.data_emitted = true;
    }
    drop(state);

    if emit && let Some(chunk) = &ret {
        core.emit(StreamEvent::Data(chunk.clone()));
    }
    ret
}

fn end_readable(core: &Arc<StreamCore>, r: &mut ReadableState) {
    if !r.end_emitted {
        r.ended = true;
        let c = core.clone();
        core.event_loop.next_tick(move || end_readable_nt(&c));
    }
}

fn end_readable_nt(core: &Arc<StreamCore>) {
    {
        let mut state = core.state.lock();
        let r = &mut state.r;
        if r.errored.is_some() || r.close_emitted || r.end_emitted || r.length() != 0 {
            return;
        }
        r.end_emitted = true;
    }
    core.emit(StreamEvent::End);

    let destroy_now = {
        let state = core.state.lock();
        state.r.auto_destroy
            && (!state.w.present
                || (state.w.auto_destroy && (state.w.finished || !state.w.writable)))
    };
    if destroy_now {
        destroy::destroy(core, None, None);
    }
}

pub(crate) fn set_encoding(core: &Arc<StreamCore>, encoding: Encoding) {
    let mut state = core.state.lock();
    let r = &mut state.r;
    let mut decoder = StringDecoder::new(encoding);
    r.encoding = Some(decoder.encoding());

    let mut content = String::new();
    for chunk in r.buffer.iter() {
        match chunk {
            Chunk::Bytes(bytes) => content.push_str(&decoder.write(bytes)),
            other => content.push_str(&decoder.write(other.to_text(Encoding::Utf8).as_bytes())),
        }
    }
    r.buffer.clear();
    if !content.is_empty() {
        r.buffer.push(Chunk::Text(content));
    }
    r.decoder = Some(decoder);
}

pub(crate) fn resume(core: &Arc<StreamCore>) {
    let mut state = core.state.lock();
    let r = &mut state.r;
    if r.flowing != Some(true) {
        r.flowing = Some(!r.readable_listening);
        if !r.resume_scheduled {
            r.resume_scheduled = true;
            let c = core.clone();
            core.event_loop.next_tick(move || resume_nt(&c));
        }
    }
    r.paused = Some(false);
}

fn resume_nt(core: &Arc<StreamCore>) {
    if !core.state.lock().r.reading {
        read(core, Some(0));
    }
    core.state.lock().r.resume_scheduled = false;
    core.emit(StreamEvent::Resume);
    flow(core);
    let again = {
        let state = core.state.lock();
        state.r.flowing == Some(true) && !state.r.reading
    };
    if again {
        read(core, Some(0));
    }
}

pub(crate) fn pause(core: &Arc<StreamCore>) {
    let emit = {
        let mut state = core.state.lock();
        let r = &mut state.r;
        let emit = r.flowing != Some(false);
        if emit {
            r.flowing = Some(false);
        }
        r.paused = Some(true);
        emit
    };
    if emit {
        core.emit(StreamEvent::Pause);
    }
}

pub(crate) fn is_paused(core: &Arc<StreamCore>) -> bool {
    let state = core.state.lock();
    state.r.paused == Some(true) || state.r.flowing == Some(false)
}

pub(crate) fn on_listener_added(core: &Arc<StreamCore>, kind: EventKind) {
    match kind {
        EventKind::Data => {
            let resume_now = {
                let mut state = core.state.lock();
                state.r.readable_listening = core.emitter.listener_count(EventKind::Readable) > 0;
                state.r.flowing != Some(false)
            };
            if resume_now {
                resume(core);
            }
        }
        EventKind::Readable => {
            let mut state = core.state.lock();
            let r = &mut state.r;
            if !r.end_emitted && !r.readable_listening {
                r.readable_listening = true;
                r.need_readable = true;
                r.flowing = Some(false);
                r.emitted_readable = false;
                if r.length() > 0 {
                    emit_readable(core, r);
                } else if !r.reading {
                    let c = core.clone();
                    core.event_loop.next_tick(move || {
                        read(&c, Some(0));
                    });
                }
            }
        }
        _ => {}
    }
}

pub(crate) fn update_readable_listening(core: &Arc<StreamCore>) {
    let resume_now = {
        let mut state = core.state.lock();
        let r = &mut state.r;
        r.readable_listening = core.emitter.listener_count(EventKind::Readable) > 0;
        if r.resume_scheduled && r.paused == Some(false) {
            r.flowing = Some(true);
            false
        } else if core.emitter.listener_count(EventKind::Data) > 0 {
            true
        } else {
            if !r.readable_listening {
                r.flowing = None;
            }
            false
        }
    };
    if resume_now {
        resume(core);
    }
}

/// One source-to-destination pipe and the listeners it installed.
pub(crate) struct PipeLink {
    pub(crate) dest: Arc<StreamCore>,
    src: Weak<StreamCore>,
    state: Mutex<PipeLinkState>,
}

#[derive(Default)]
struct PipeLinkState {
    src_listeners: Vec<(EventKind, ListenerId)>,
    dest_listeners: Vec<(EventKind, ListenerId)>,
    ondrain: Option<ListenerId>,
    cleaned_up: bool,
}

impl PipeLink {
    fn track_src(&self, kind: EventKind, id: ListenerId) {
        self.state.lock().src_listeners.push((kind, id));
    }

    fn track_dest(&self, kind: EventKind, id: ListenerId) {
        self.state.lock().dest_listeners.push((kind, id));
    }

    /// Remove every listener this pipe installed.
    fn cleanup(&self) {
        let (src_listeners, dest_listeners, had_ondrain) = {
            let mut state = self.state.lock();
            if state.cleaned_up {
                return;
            }
            state.cleaned_up = true;
            (
                std::mem::take(&mut state.src_listeners),
                std::mem::take(&mut state.dest_listeners),
                state.ondrain.take().is_some(),
            )
        };
        let src = self.src.upgrade();
        if let Some(src) = &src {
            for (kind, id) in src_listeners {
                src.emitter.remove_listener(kind, id);
            }
        }
        for (kind, id) in dest_listeners {
            self.dest.emitter.remove_listener(kind, id);
        }

        if had_ondrain && let Some(src) = src {
            let waiting = !src.state.lock().r.await_drain.is_empty();
            let dest_needs_drain = {
                let state = self.dest.state.lock();
                !state.w.present || state.w.need_drain
            };
            if waiting && dest_needs_drain {
                pipe_on_drain(&src, &self.dest);
            }
        }
    }

    fn is_cleaned_up(&self) -> bool {
        self.state.lock().cleaned_up
    }
}

fn pipe_on_drain(src: &Arc<StreamCore>, dest: &Arc<StreamCore>) {
    let resume_now = {
        let mut state = src.state.lock();
        state.r.await_drain.remove(&dest.id);
        state.r.await_drain.is_empty() && src.emitter.listener_count(EventKind::Data) > 0
    };
    if resume_now {
        resume(src);
    }
}

/// Pause the source until `dest` drains.
fn pipe_pause(link: &Arc<PipeLink>) {
    let Some(src) = link.src.upgrade() else {
        return;
    };
    if !link.is_cleaned_up() {
        {
            let mut state = src.state.lock();
            let piped = state.r.pipes.iter().any(|p| Arc::ptr_eq(p, link));
            if piped {
                state.r.await_drain.insert(link.dest.id);
            }
        }
        pause(&src);
    }

    let needs_ondrain = link.state.lock().ondrain.is_none();
    if needs_ondrain {
        let weak_src = link.src.clone();
        let dest = link.dest.clone();
        let id = link.dest.emitter.on(EventKind::Drain, move |_| {
            if let Some(src) = weak_src.upgrade() {
                pipe_on_drain(&src, &dest);
            }
        });
        link.state.lock().ondrain = Some(id);
        link.track_dest(EventKind::Drain, id);
    }
}

pub(crate) fn pipe(src: &Arc<StreamCore>, dest: &Arc<StreamCore>, options: PipeOptions) {
    let link = Arc::new(PipeLink {
        dest: dest.clone(),
        src: Arc::downgrade(src),
        state: Mutex::new(PipeLinkState::default()),
    });
    let end_emitted = {
        let mut state = src.state.lock();
        state.r.pipes.push(link.clone());
        state.r.end_emitted
    };
    tracing::debug!(src = %src.id, dest = %dest.id, end = options.end, "Piping stream");

    let end_fn: Arc<dyn Fn() + Send + Sync> = {
        let weak_src = Arc::downgrade(src);
        let dest = dest.clone();
        if options.end {
            Arc::new(move || writable::end(&dest, None, None, None))
        } else {
            Arc::new(move || {
                if let Some(src) = weak_src.upgrade() {
                    unpipe(&src, Some(&dest));
                }
            })
        }
    };
    if end_emitted {
        let end_fn = end_fn.clone();
        src.event_loop.next_tick(move || end_fn());
    } else {
        let id = src.emitter.once(EventKind::End, move |_| end_fn());
        link.track_src(EventKind::End, id);
    }

    let data_link = link.clone();
    let ondata = Arc::new(move |event: &StreamEvent| {
        let StreamEvent::Data(chunk) = event else {
            return;
        };
        match writable::write(&data_link.dest, chunk.clone(), None, None) {
            Ok(true) => {}
            Ok(false) => pipe_pause(&data_link),
            Err(err) => {
                error_or_destroy(&data_link.dest, err, false);
                pipe_pause(&data_link);
            }
        }
    });
    let id = src.add_listener(EventKind::Data, ondata, false, false);
    link.track_src(EventKind::Data, id);

    let error_link = Arc::downgrade(&link);
    let onerror = Arc::new(move |event: &StreamEvent| {
        let StreamEvent::Error(err) = event else {
            return;
        };
        let Some(link) = error_link.upgrade() else {
            return;
        };
        if let Some(src) = link.src.upgrade() {
            unpipe(&src, Some(&link.dest));
        }
        if link.dest.emitter.listener_count(EventKind::Error) == 0 {
            let error_emitted = link.dest.state.lock().error_emitted();
            if error_emitted {
                link.dest.event_loop.report_unhandled(err.clone());
            } else {
                error_or_destroy(&link.dest, err.clone(), false);
            }
        }
    });
    let id = dest.emitter.add_listener(EventKind::Error, onerror, false, true);
    link.track_dest(EventKind::Error, id);

    let close_link = Arc::downgrade(&link);
    let id = dest.emitter.once(EventKind::Close, move |_| {
        if let Some(link) = close_link.upgrade()
            && let Some(src) = link.src.upgrade()
        {
            unpipe(&src, Some(&link.dest));
        }
    });
    link.track_dest(EventKind::Close, id);

    let finish_link = Arc::downgrade(&link);
    let id = dest.emitter.once(EventKind::Finish, move |_| {
        if let Some(link) = finish_link.upgrade()
            && let Some(src) = link.src.upgrade()
        {
            unpipe(&src, Some(&link.dest));
        }
    });
    link.track_dest(EventKind::Finish, id);

    dest.emit(StreamEvent::Pipe(src.id));

    let (dest_needs_drain, flowing) = {
        let dest_state = dest.state.lock();
        let need_drain = dest_state.w.present && dest_state.w.need_drain;
        drop(dest_state);
        (need_drain, src.state.lock().r.flowing)
    };
    if dest_needs_drain {
        pipe_pause(&link);
    } else if flowing != Some(true) {
        resume(src);
    }
}

pub(crate) fn unpipe(src: &Arc<StreamCore>, dest: Option<&Arc<StreamCore>>) {
    let (removed, pause_src) = {
        let mut state = src.state.lock();
        let pipes = &mut state.r.pipes;
        if pipes.is_empty() {
            return;
        }
        match dest {
            None => (std::mem::take(pipes), true),
            Some(dest) => {
                let Some(index) = pipes.iter().position(|p| Arc::ptr_eq(&p.dest, dest)) else {
                    return;
                };
                let link = pipes.remove(index);
                (vec![link], pipes.is_empty())
            }
        }
    };
    if pause_src {
        pause(src);
    }
    for link in removed {
        tracing::debug!(src = %src.id, dest = %link.dest.id, "Unpiping stream");
        link.cleanup();
        link.dest.emit(StreamEvent::Unpipe(src.id));
    }
}
