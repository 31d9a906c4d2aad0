//! Folding a chain of stages into one duplex.
//!
//! Writes go to the first stage, reads come from the last one and the
//! stages in between are connected with [`pipeline`]. Destroying the
//! composite tears the whole chain down; a failure anywhere in the chain
//! destroys the composite.

use crate::destroy;
use crate::duplex::Duplex;
use crate::error::{StreamError, StreamResult};
use crate::event_loop::EventLoop;
use crate::events::{EventKind, StreamEvent};
use crate::options::{Callback, DuplexOptions};
use crate::pipeline::{PipelineOptions, Stage, pipeline};
use crate::readable::{self, Readable};
use crate::stream::StreamCore;
use crate::writable::{self, Writable};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

enum ChainState {
    Running,
    /// The composite was destroyed; its destroy completes with the chain.
    Closing(Callback),
    Done,
}

struct Pending {
    on_drain: Option<Callback>,
    on_finish: Option<Callback>,
    on_readable: bool,
    chain: ChainState,
}

type Shared = Arc<Mutex<Pending>>;

fn take_and_call(slot: Option<Callback>) {
    if let Some(callback) = slot {
        callback(None);
    }
}

/// Combine `stages` into a single duplex.
///
/// The first stage must be a stream; when it has no writable side the
/// composite is read-only. Likewise the last stage decides whether the
/// composite is readable.
pub fn compose(event_loop: &EventLoop, mut stages: Vec<Stage>) -> StreamResult<Duplex> {
    if stages.is_empty() {
        return Err(StreamError::MissingArgs("streams"));
    }
    if stages.len() == 1 {
        return match stages.pop() {
            Some(Stage::Duplex(duplex)) => Ok(duplex),
            Some(stage) => Err(StreamError::InvalidStage(format!(
                "cannot compose a single {stage:?} stage"
            ))),
            None => Err(StreamError::MissingArgs("streams")),
        };
    }

    let (Some(head), Some(tail)) = (
        stages.first().and_then(Stage::core).cloned(),
        stages.last().and_then(Stage::core).cloned(),
    ) else {
        return Err(StreamError::InvalidStage(
            "composition must start and end with a stream".into(),
        ));
    };

    let (writable, writable_object_mode) = {
        let state = head.state.lock();
        (state.w.present && state.w.is_writable(), state.w.object_mode)
    };
    let (readable, readable_object_mode) = {
        let state = tail.state.lock();
        (state.r.present && state.r.is_readable(), state.r.object_mode)
    };

    let shared: Shared = Arc::new(Mutex::new(Pending {
        on_drain: None,
        on_finish: None,
        on_readable: false,
        chain: ChainState::Running,
    }));

    let mut options = DuplexOptions::new()
        .writable_object_mode(writable_object_mode)
        .readable_object_mode(readable_object_mode)
        .writable(writable)
        .readable(readable);

    if writable {
        let write_head = head.clone();
        let write_shared = shared.clone();
        let final_head = head.clone();
        let final_shared = shared.clone();
        options = options
            .write(move |_: &Writable, chunk, encoding, callback| {
                match writable::write(&write_head, chunk, Some(encoding), None) {
                    Ok(true) => callback(None),
                    Ok(false) => write_shared.lock().on_drain = Some(callback),
                    Err(err) => callback(Some(err)),
                }
            })
            .final_(move |_: &Writable, callback| {
                final_shared.lock().on_finish = Some(callback);
                writable::end(&final_head, None, None, None);
            });
    }

    if readable {
        let read_tail = tail.clone();
        let read_shared = shared.clone();
        options = options.read(move |stream: &Readable, _| {
            pull(&stream.core, &read_tail, &read_shared);
            Ok(())
        });
    }

    let destroy_tail = Arc::downgrade(&tail);
    let destroy_shared = shared.clone();
    options = options.destroy(move |error, callback| {
        let mut pending = destroy_shared.lock();
        let running = !matches!(pending.chain, ChainState::Done);
        let error = match error {
            None if running => Some(StreamError::aborted(None)),
            other => other,
        };
        pending.on_drain = None;
        pending.on_finish = None;
        pending.on_readable = false;
        if !running {
            drop(pending);
            callback(error);
            return;
        }
        pending.chain = ChainState::Closing(callback);
        drop(pending);
        if let Some(tail) = destroy_tail.upgrade() {
            destroy::destroy(&tail, Some(error.unwrap_or(StreamError::Destroyed("pipe"))), None);
        }
    });

    let composite = Duplex::new(event_loop, options);
    let weak: Weak<StreamCore> = Arc::downgrade(&composite.core);

    let chain_shared = shared.clone();
    let chain_composite = weak.clone();
    pipeline(event_loop, stages, PipelineOptions::new(), move |error| {
        on_chain_finished(&chain_shared, &chain_composite, error, readable, writable)
    })?;

    if writable {
        let drain_shared = shared.clone();
        head.add_listener(
            EventKind::Drain,
            Arc::new(move |_: &StreamEvent| {
                let callback = drain_shared.lock().on_drain.take();
                take_and_call(callback);
            }),
            false,
            false,
        );
        let finish_shared = shared.clone();
        tail.add_listener(
            EventKind::Finish,
            Arc::new(move |_: &StreamEvent| {
                let callback = finish_shared.lock().on_finish.take();
                take_and_call(callback);
            }),
            false,
            false,
        );
    }

    if readable {
        let readable_shared = shared.clone();
        let readable_composite = weak.clone();
        let readable_tail = Arc::downgrade(&tail);
        tail.add_listener(
            EventKind::Readable,
            Arc::new(move |_: &StreamEvent| {
                let waiting = std::mem::take(&mut readable_shared.lock().on_readable);
                if waiting
                    && let (Some(composite), Some(tail)) =
                        (readable_composite.upgrade(), readable_tail.upgrade())
                {
                    pull(&composite, &tail, &readable_shared);
                }
            }),
            false,
            false,
        );
        let end_composite = weak;
        tail.add_listener(
            EventKind::End,
            Arc::new(move |_: &StreamEvent| {
                if let Some(composite) = end_composite.upgrade() {
                    readable::push(&composite, None, None);
                }
            }),
            false,
            false,
        );
    }

    tracing::debug!(
        stream_id = %composite.core.id,
        readable,
        writable,
        "Composed stream"
    );
    Ok(composite)
}

/// Move everything the tail has into the composite until it pushes back.
fn pull(composite: &Arc<StreamCore>, tail: &Arc<StreamCore>, shared: &Shared) {
    loop {
        match readable::read(tail, None) {
            None => {
                shared.lock().on_readable = true;
                return;
            }
            Some(chunk) => {
                if !readable::push(composite, Some(chunk), None) {
                    return;
                }
            }
        }
    }
}

fn on_chain_finished(
    shared: &Shared,
    composite: &Weak<StreamCore>,
    error: Option<StreamError>,
    readable: bool,
    writable: bool,
) {
    let previous = std::mem::replace(&mut shared.lock().chain, ChainState::Done);
    if let ChainState::Closing(callback) = previous {
        callback(error);
        return;
    }
    let Some(composite) = composite.upgrade() else {
        return;
    };
    if let Some(err) = error {
        destroy::destroy(&composite, Some(err), None);
    } else if !readable && !writable {
        destroy::destroy(&composite, None, None);
    }
}
