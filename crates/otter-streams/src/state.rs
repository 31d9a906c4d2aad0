//! Flow-control bookkeeping for the two stream halves.
//!
//! Every stream object owns one [`Halves`] record behind its lock. A pure
//! readable has an absent writable half and vice versa; a duplex has both.
//! Flags documented as monotonic only go back to `false` through
//! `undestroy`.

use crate::buffer_list::BufferList;
use crate::chunk::{Chunk, Encoding};
use crate::decoder::StringDecoder;
use crate::error::StreamError;
use crate::events::StreamId;
use crate::options::Callback;
use crate::readable::PipeLink;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

/// Bookkeeping of the readable half.
pub(crate) struct ReadableState {
    pub present: bool,
    pub object_mode: bool,
    pub high_water_mark: usize,
    pub buffer: BufferList,
    pub pipes: Vec<Arc<PipeLink>>,
    /// `None` until a consumer picks a mode.
    pub flowing: Option<bool>,
    /// Explicit `pause()`/`resume()` call, `None` when neither happened.
    pub paused: Option<bool>,
    pub ended: bool,
    pub end_emitted: bool,
    pub reading: bool,
    pub constructed: bool,
    /// Inside the pull hook; pushes made now must not emit synchronously.
    pub sync: bool,
    pub need_readable: bool,
    pub emitted_readable: bool,
    pub readable_listening: bool,
    pub resume_scheduled: bool,
    pub reading_more: bool,
    pub data_emitted: bool,
    pub emit_close: bool,
    pub auto_destroy: bool,
    pub destroyed: bool,
    pub errored: Option<StreamError>,
    pub closed: bool,
    pub close_emitted: bool,
    pub error_emitted: bool,
    pub default_encoding: Encoding,
    /// Pipe destinations that reported backpressure and owe a `drain`.
    pub await_drain: HashSet<StreamId>,
    pub decoder: Option<StringDecoder>,
    pub encoding: Option<Encoding>,
    /// False when the half was disabled at construction.
    pub readable: bool,
}

impl ReadableState {
    pub fn new(object_mode: bool, high_water_mark: usize, encoding: Option<Encoding>) -> Self {
        Self {
            present: true,
            object_mode,
            high_water_mark,
            buffer: BufferList::new(object_mode),
            pipes: Vec::new(),
            flowing: None,
            paused: None,
            ended: false,
            end_emitted: false,
            reading: false,
            constructed: true,
            sync: true,
            need_readable: false,
            emitted_readable: false,
            readable_listening: false,
            resume_scheduled: false,
            reading_more: false,
            data_emitted: false,
            emit_close: true,
            auto_destroy: true,
            destroyed: false,
            errored: None,
            closed: false,
            close_emitted: false,
            error_emitted: false,
            default_encoding: Encoding::Utf8,
            await_drain: HashSet::new(),
            decoder: encoding.map(StringDecoder::new),
            encoding,
            readable: true,
        }
    }

    /// Placeholder for streams without a readable half.
    pub fn absent() -> Self {
        Self {
            present: false,
            ..Self::new(false, 0, None)
        }
    }

    /// Buffered length in mode units.
    pub fn length(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the half can still produce data for consumers.
    pub fn is_readable(&self) -> bool {
        self.present && self.readable && !self.destroyed && !self.error_emitted && !self.end_emitted
    }

    /// `end` emitted, or ended with nothing left to read.
    pub fn is_finished(&self, strict: bool) -> bool {
        if self.errored.is_some() {
            return false;
        }
        self.end_emitted || (!strict && self.ended && self.length() == 0)
    }
}

/// A write waiting in the buffer.
pub(crate) struct BufferedWrite {
    pub chunk: Chunk,
    pub encoding: Encoding,
    pub callback: Option<Callback>,
}

/// Bookkeeping of the writable half.
pub(crate) struct WritableState {
    pub present: bool,
    pub object_mode: bool,
    pub high_water_mark: usize,
    pub decode_strings: bool,
    pub default_encoding: Encoding,
    /// Units written but not yet acknowledged by the sink.
    pub length: usize,
    pub writing: bool,
    pub corked: u32,
    /// Inside the sink hook; completions observed now are deferred a tick.
    pub sync: bool,
    pub buffer_processing: bool,
    pub write_len: usize,
    pub write_cb: Option<Callback>,
    pub buffered: VecDeque<BufferedWrite>,
    /// Completions owed before `finish` may be declared.
    pub pending_cb: usize,
    pub constructed: bool,
    pub prefinished: bool,
    pub final_called: bool,
    pub need_drain: bool,
    pub ending: bool,
    pub ended: bool,
    pub finished: bool,
    pub destroyed: bool,
    pub errored: Option<StreamError>,
    pub closed: bool,
    pub close_emitted: bool,
    pub error_emitted: bool,
    pub emit_close: bool,
    pub auto_destroy: bool,
    /// Callbacks of synchronous writes, completed together on the next tick.
    pub after_write: Vec<Callback>,
    /// `end()` callbacks waiting for `finish`.
    pub on_finished: Vec<Callback>,
    /// False when the half was disabled at construction.
    pub writable: bool,
}

impl WritableState {
    pub fn new(object_mode: bool, high_water_mark: usize) -> Self {
        Self {
            present: true,
            object_mode,
            high_water_mark,
            decode_strings: true,
            default_encoding: Encoding::Utf8,
            length: 0,
            writing: false,
            corked: 0,
            sync: true,
            buffer_processing: false,
            write_len: 0,
            write_cb: None,
            buffered: VecDeque::new(),
            pending_cb: 0,
            constructed: true,
            prefinished: false,
            final_called: false,
            need_drain: false,
            ending: false,
            ended: false,
            finished: false,
            destroyed: false,
            errored: None,
            closed: false,
            close_emitted: false,
            error_emitted: false,
            emit_close: true,
            auto_destroy: true,
            after_write: Vec::new(),
            on_finished: Vec::new(),
            writable: true,
        }
    }

    /// Placeholder for streams without a writable half.
    pub fn absent() -> Self {
        Self {
            present: false,
            ..Self::new(false, 0)
        }
    }

    /// Whether the half still accepts writes.
    pub fn is_writable(&self) -> bool {
        self.present
            && self.writable
            && !self.destroyed
            && self.errored.is_none()
            && !self.ending
            && !self.ended
    }

    /// `finish` emitted, or ended with nothing left to flush.
    pub fn is_finished(&self, strict: bool) -> bool {
        if self.errored.is_some() {
            return false;
        }
        self.finished || (!strict && self.ended && self.length == 0)
    }

    /// All conditions for declaring `finish` hold.
    pub fn need_finish(&self) -> bool {
        self.ending
            && !self.destroyed
            && self.constructed
            && self.length == 0
            && self.errored.is_none()
            && self.buffered.is_empty()
            && !self.finished
            && !self.writing
            && !self.error_emitted
            && !self.close_emitted
    }
}

/// Destroy requested before construction completed.
pub(crate) struct PendingDestroy {
    pub error: Option<StreamError>,
    pub callback: Option<Callback>,
}

/// The state record of one stream object.
pub(crate) struct Halves {
    pub r: ReadableState,
    pub w: WritableState,
    pub construct_waiters: Vec<Box<dyn FnOnce() + Send>>,
    pub pending_destroy: Option<PendingDestroy>,
}

impl Halves {
    pub fn new(r: ReadableState, w: WritableState) -> Self {
        Self {
            r,
            w,
            construct_waiters: Vec::new(),
            pending_destroy: None,
        }
    }

    /// Either present half is destroyed.
    pub fn any_destroyed(&self) -> bool {
        (self.w.present && self.w.destroyed) || (self.r.present && self.r.destroyed)
    }

    /// Every present half is destroyed.
    pub fn all_destroyed(&self) -> bool {
        (!self.r.present || self.r.destroyed) && (!self.w.present || self.w.destroyed)
    }

    /// Construction finished for the primary half.
    pub fn constructed(&self) -> bool {
        if self.w.present {
            self.w.constructed
        } else {
            self.r.constructed
        }
    }

    pub fn closed(&self) -> bool {
        (self.w.present && self.w.closed) || (self.r.present && self.r.closed)
    }

    pub fn error_emitted(&self) -> bool {
        (self.w.present && self.w.error_emitted) || (self.r.present && self.r.error_emitted)
    }

    pub fn close_emitted(&self) -> bool {
        (self.w.present && self.w.close_emitted) || (self.r.present && self.r.close_emitted)
    }

    /// Error of either half, writable first.
    pub fn errored(&self) -> Option<StreamError> {
        self.w
            .errored
            .clone()
            .filter(|_| self.w.present)
            .or_else(|| self.r.errored.clone().filter(|_| self.r.present))
    }

    /// Record `error` on every present half that has none yet.
    pub fn record_error(&mut self, error: Option<&StreamError>) {
        let Some(error) = error else {
            return;
        };
        if self.w.present && self.w.errored.is_none() {
            self.w.errored = Some(error.clone());
        }
        if self.r.present && self.r.errored.is_none() {
            self.r.errored = Some(error.clone());
        }
    }

    /// A `close` event will follow once the stream is torn down.
    pub fn will_emit_close(&self) -> bool {
        let (auto_destroy, emit_close, closed) = if self.w.present {
            (self.w.auto_destroy, self.w.emit_close, self.w.closed)
        } else {
            (self.r.auto_destroy, self.r.emit_close, self.r.closed)
        };
        auto_destroy && emit_close && !closed
    }

    pub fn status(&self, id: StreamId) -> StreamStatus {
        StreamStatus {
            id: id.0,
            readable: self.r.present.then(|| ReadableStatus {
                length: self.r.length(),
                high_water_mark: self.r.high_water_mark,
                object_mode: self.r.object_mode,
                flowing: self.r.flowing,
                ended: self.r.ended,
                end_emitted: self.r.end_emitted,
                reading: self.r.reading,
                destroyed: self.r.destroyed,
                errored: self.r.errored.as_ref().map(|e| e.to_string()),
                closed: self.r.closed,
                pipes: self.r.pipes.len(),
                encoding: self.r.encoding,
            }),
            writable: self.w.present.then(|| WritableStatus {
                length: self.w.length,
                high_water_mark: self.w.high_water_mark,
                object_mode: self.w.object_mode,
                writing: self.w.writing,
                corked: self.w.corked,
                buffered: self.w.buffered.len(),
                pending_cb: self.w.pending_cb,
                need_drain: self.w.need_drain,
                ending: self.w.ending,
                ended: self.w.ended,
                finished: self.w.finished,
                destroyed: self.w.destroyed,
                errored: self.w.errored.as_ref().map(|e| e.to_string()),
                closed: self.w.closed,
            }),
            destroyed: self.all_destroyed(),
            closed: self.closed(),
        }
    }
}

/// Serializable snapshot of a stream's flags, for host-side inspection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatus {
    pub id: u64,
    pub readable: Option<ReadableStatus>,
    pub writable: Option<WritableStatus>,
    pub destroyed: bool,
    pub closed: bool,
}

/// Snapshot of the readable half.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadableStatus {
    pub length: usize,
    pub high_water_mark: usize,
    pub object_mode: bool,
    pub flowing: Option<bool>,
    pub ended: bool,
    pub end_emitted: bool,
    pub reading: bool,
    pub destroyed: bool,
    pub errored: Option<String>,
    pub closed: bool,
    pub pipes: usize,
    pub encoding: Option<Encoding>,
}

/// Snapshot of the writable half.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WritableStatus {
    pub length: usize,
    pub high_water_mark: usize,
    pub object_mode: bool,
    pub writing: bool,
    pub corked: u32,
    pub buffered: usize,
    pub pending_cb: usize,
    pub need_drain: bool,
    pub ending: bool,
    pub ended: bool,
    pub finished: bool,
    pub destroyed: bool,
    pub errored: Option<String>,
    pub closed: bool,
}
