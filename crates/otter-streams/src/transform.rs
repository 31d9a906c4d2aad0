//! Transform streams.
//!
//! Chunks written to the writable side go through the transform hook and
//! its output is pushed to the readable side. The write callback of the
//! chunk being transformed is the only credit between the two halves: when
//! the readable side is saturated it is parked in a single slot and released
//! by the next read demand, which throttles the writer.

use crate::chunk::{Chunk, Encoding};
use crate::duplex::Duplex;
use crate::error::StreamError;
use crate::event_loop::EventLoop;
use crate::options::{Callback, DestroyHook, TransformCallback, TransformHook, TransformOptions};
use crate::readable::{self, Readable};
use crate::stream::StreamCore;
use crate::writable::Writable;
use parking_lot::Mutex;
use std::ops::Deref;
use std::sync::Arc;

/// A transform stream handle; derefs to the underlying [`Duplex`].
#[derive(Debug, Clone)]
pub struct Transform {
    pub(crate) duplex: Duplex,
}

/// Write callback waiting for read demand, plus the input units
/// transformed since the last demand.
#[derive(Default)]
struct TransformSlot {
    pending: Option<Callback>,
    credit_used: usize,
}

type Slot = Arc<Mutex<TransformSlot>>;

impl Transform {
    /// Create a transform stream on `event_loop`.
    pub fn new(event_loop: &EventLoop, options: TransformOptions) -> Self {
        let TransformOptions {
            duplex: mut options,
            transform,
            flush,
        } = options;
        let slot: Slot = Arc::default();

        let write_slot = slot.clone();
        options.hooks.write = Some(Arc::new(move |stream: &Writable, chunk, encoding, callback| {
            on_write(stream, chunk, encoding, callback, transform.as_ref(), &write_slot)
        }));
        options.hooks.writev = None;

        let read_slot = slot.clone();
        options.hooks.read = Some(Arc::new(move |_: &Readable, _| {
            let pending = {
                let mut slot = read_slot.lock();
                slot.credit_used = 0;
                slot.pending.take()
            };
            if let Some(callback) = pending {
                callback(None);
            }
            Ok(())
        }));

        options.hooks.final_ = Some(Arc::new(move |stream: &Writable, callback| {
            flush_and_end(&stream.core, flush.as_ref(), callback)
        }));

        let user_destroy = options.hooks.destroy.take();
        let destroy_slot = slot;
        let destroy: DestroyHook = Arc::new(move |error, callback| {
            // The parked chunk was already transformed; completing it lets
            // the buffered writes behind it fail with the destroy error.
            let pending = destroy_slot.lock().pending.take();
            if let Some(pending) = pending {
                pending(None);
            }
            match &user_destroy {
                Some(hook) => hook(error, callback),
                None => callback(error),
            }
        });
        options.hooks.destroy = Some(destroy);

        let duplex = Duplex::new(event_loop, options);
        duplex.core.state.lock().r.sync = false;
        Self { duplex }
    }

    /// A transform that forwards every chunk unchanged.
    pub fn pass_through(event_loop: &EventLoop, options: TransformOptions) -> Self {
        Self::new(
            event_loop,
            options.transform(|_, chunk, _, callback| callback(Ok(Some(chunk)))),
        )
    }

    pub fn into_duplex(self) -> Duplex {
        self.duplex
    }
}

impl Deref for Transform {
    type Target = Duplex;

    fn deref(&self) -> &Duplex {
        &self.duplex
    }
}

fn on_write(
    stream: &Writable,
    chunk: Chunk,
    encoding: Encoding,
    callback: Callback,
    transform: Option<&TransformHook>,
    slot: &Slot,
) {
    let Some(transform) = transform else {
        callback(Some(StreamError::MethodNotImplemented("_transform")));
        return;
    };
    let core = stream.core.clone();
    let units = {
        let state = core.state.lock();
        chunk.len_in(state.w.object_mode).max(1)
    };
    let readable = Readable::from_core(core.clone());
    let slot = slot.clone();
    let done: TransformCallback = Box::new(move |result| match result {
        Err(err) => callback(Some(err)),
        Ok(output) => {
            let pushed = match output {
                Some(chunk) if !chunk.is_null() => {
                    readable::push(&core, Some(chunk), None);
                    true
                }
                _ => false,
            };
            release_or_park(&core, &slot, units, pushed, callback);
        }
    });
    transform(&readable, chunk, encoding, done);
}

/// Decide whether the writer may continue right away.
fn release_or_park(core: &Arc<StreamCore>, slot: &Slot, units: usize, pushed: bool, callback: Callback) {
    enum Next {
        Now(Callback),
        NextTick(Callback),
        Parked,
    }
    let next = {
        let state = core.state.lock();
        let mut slot = slot.lock();
        slot.credit_used += units;
        let r = &state.r;
        if r.ended {
            Next::NextTick(callback)
        } else if state.w.ending {
            Next::Now(callback)
        } else if (pushed && r.length() >= r.high_water_mark)
            || (!r.reading && slot.credit_used >= r.high_water_mark)
        {
            slot.pending = Some(callback);
            Next::Parked
        } else {
            Next::Now(callback)
        }
    };
    match next {
        Next::Now(callback) => callback(None),
        Next::NextTick(callback) => core.event_loop.next_tick(move || callback(None)),
        Next::Parked => {
            tracing::trace!(stream_id = %core.id, "Transform waiting for read demand");
        }
    }
}

fn flush_and_end(core: &Arc<StreamCore>, flush: Option<&crate::options::FlushHook>, callback: Callback) {
    let destroyed = core.state.lock().any_destroyed();
    match flush {
        Some(flush) if !destroyed => {
            let c = core.clone();
            let readable = Readable::from_core(core.clone());
            flush(
                &readable,
                Box::new(move |result| match result {
                    Err(err) => callback(Some(err)),
                    Ok(output) => {
                        if let Some(chunk) = output
                            && !chunk.is_null()
                        {
                            readable::push(&c, Some(chunk), None);
                        }
                        readable::push(&c, None, None);
                        callback(None);
                    }
                }),
            );
        }
        _ => {
            readable::push(core, None, None);
            callback(None);
        }
    }
}
