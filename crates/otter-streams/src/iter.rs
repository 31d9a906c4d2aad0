//! Async iteration over readables, and readables built from async sources.

use crate::chunk::Chunk;
use crate::destroy;
use crate::end_of_stream::{Cleanup, FinishedOptions, eos};
use crate::error::{StreamError, StreamResult};
use crate::event_loop::EventLoop;
use crate::events::{EventKind, ListenerId, StreamEvent};
use crate::options::ReadableOptions;
use crate::readable::{self, Readable};
use crate::stream::StreamCore;
use futures_util::stream::{BoxStream, Stream, StreamExt};
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

#[derive(Default)]
struct IterShared {
    waker: Mutex<Option<Waker>>,
    /// `None` while running, `Some(None)` after a clean end.
    outcome: Mutex<Option<Option<StreamError>>>,
}

impl IterShared {
    fn wake(&self) {
        if let Some(waker) = self.waker.lock().take() {
            waker.wake();
        }
    }
}

/// Single-consumer async sequence of the chunks of a readable.
///
/// Created by [`Readable::iter`]. Once it returned `None` or an error it
/// stays exhausted. Dropping it early destroys the stream unless it was
/// created with `destroy_on_return = false`.
pub struct ReadableIter {
    core: Arc<StreamCore>,
    destroy_on_return: bool,
    shared: Arc<IterShared>,
    listener: Option<ListenerId>,
    cleanup: Option<Cleanup>,
    started: bool,
    done: bool,
}

impl std::fmt::Debug for ReadableIter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadableIter")
            .field("stream_id", &self.core.id)
            .field("done", &self.done)
            .finish()
    }
}

impl ReadableIter {
    pub(crate) fn new(core: Arc<StreamCore>, destroy_on_return: bool) -> Self {
        Self {
            core,
            destroy_on_return,
            shared: Arc::default(),
            listener: None,
            cleanup: None,
            started: false,
            done: false,
        }
    }

    fn start(&mut self) {
        self.started = true;
        let shared = self.shared.clone();
        self.listener = Some(self.core.add_listener(
            EventKind::Readable,
            Arc::new(move |_: &StreamEvent| shared.wake()),
            false,
            false,
        ));
        let shared = self.shared.clone();
        self.cleanup = Some(eos(
            &self.core,
            FinishedOptions::new().writable(false),
            Box::new(move |err| {
                {
                    let mut outcome = shared.outcome.lock();
                    let previous = outcome.take().flatten();
                    *outcome = Some(match err {
                        Some(err) => StreamError::aggregate(previous, Some(err)),
                        None => previous,
                    });
                }
                shared.wake();
            }),
        ));
    }

    /// Release the stream: destroy it, or only detach when it should
    /// survive the iteration.
    fn finish(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        if !self.started {
            return;
        }
        let outcome = self.shared.outcome.lock().clone();
        let errored = matches!(outcome, Some(Some(_)));
        let auto_destroy = self.core.state.lock().r.auto_destroy;
        if (errored || self.destroy_on_return) && (outcome.is_none() || auto_destroy) {
            destroy::destroy(&self.core, None, None);
        } else {
            if let Some(id) = self.listener.take() {
                self.core.remove_listener(EventKind::Readable, id);
            }
            if let Some(cleanup) = self.cleanup.take() {
                cleanup.run();
            }
        }
    }
}

impl Stream for ReadableIter {
    type Item = StreamResult<Chunk>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        if !this.started {
            this.start();
        }
        *this.shared.waker.lock() = Some(cx.waker().clone());

        let destroyed = this.core.state.lock().r.destroyed;
        let chunk = if destroyed {
            None
        } else {
            readable::read(&this.core, None)
        };
        if let Some(chunk) = chunk {
            return Poll::Ready(Some(Ok(chunk)));
        }

        let outcome = this.shared.outcome.lock().clone();
        match outcome {
            Some(Some(err)) => {
                this.finish();
                Poll::Ready(Some(Err(err)))
            }
            Some(None) => {
                this.finish();
                Poll::Ready(None)
            }
            None => Poll::Pending,
        }
    }
}

impl Drop for ReadableIter {
    fn drop(&mut self) {
        self.finish();
    }
}

struct Pump {
    source: Option<BoxStream<'static, StreamResult<Chunk>>>,
    reading: bool,
}

impl Readable {
    /// A readable producing the items of `source`, in object mode with a
    /// high-water mark of one.
    ///
    /// An `Err` item destroys the stream with that error.
    pub fn from_stream<S>(event_loop: &EventLoop, source: S) -> Self
    where
        S: Stream<Item = StreamResult<Chunk>> + Send + 'static,
    {
        Self::from_stream_with(
            event_loop,
            source,
            ReadableOptions::new().object_mode(true).high_water_mark(1),
        )
    }

    /// Like [`from_stream`](Self::from_stream) with explicit options; the
    /// read and destroy hooks are replaced.
    pub fn from_stream_with<S>(event_loop: &EventLoop, source: S, options: ReadableOptions) -> Self
    where
        S: Stream<Item = StreamResult<Chunk>> + Send + 'static,
    {
        let pump = Arc::new(Mutex::new(Pump {
            source: Some(source.boxed()),
            reading: false,
        }));

        let read_pump = pump.clone();
        let destroy_pump = pump;
        let options = options
            .read(move |stream, _| {
                let start = {
                    let mut pump = read_pump.lock();
                    !std::mem::replace(&mut pump.reading, true)
                };
                if start {
                    let core = stream.core.clone();
                    let pump = read_pump.clone();
                    stream.core.event_loop.spawn(drive(core, pump));
                }
                Ok(())
            })
            .destroy(move |err, cb| {
                destroy_pump.lock().source.take();
                cb(err)
            });
        Readable::new(event_loop, options)
    }

    /// A readable producing the items of `items`.
    pub fn from_iter<I>(event_loop: &EventLoop, items: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Chunk>,
        I::IntoIter: Send + 'static,
    {
        let source = futures_util::stream::iter(items.into_iter().map(|item| Ok(item.into())));
        Self::from_stream(event_loop, source)
    }
}

async fn drive(core: Arc<StreamCore>, pump: Arc<Mutex<Pump>>) {
    let Some(mut source) = pump.lock().source.take() else {
        return;
    };
    let mut exhausted = false;
    loop {
        match source.next().await {
            None => {
                exhausted = true;
                readable::push(&core, None, None);
                break;
            }
            Some(Ok(chunk)) if chunk.is_null() => {
                destroy::destroy(&core, Some(StreamError::NullValues), None);
                break;
            }
            Some(Ok(chunk)) => {
                if !readable::push(&core, Some(chunk), None) {
                    break;
                }
            }
            Some(Err(err)) => {
                tracing::debug!(stream_id = %core.id, error = %err, "Readable source failed");
                destroy::destroy(&core, Some(err), None);
                break;
            }
        }
    }

    let mut pump = pump.lock();
    pump.reading = false;
    let destroyed = core.state.lock().any_destroyed();
    if !exhausted && !destroyed {
        pump.source = Some(source);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::NodeStream;
    use serde_json::json;

    #[test]
    fn test_iterate_to_end() {
        let event_loop = EventLoop::new();
        let stream = Readable::from_iter(&event_loop, vec![json!(1), json!(2), json!(3)]);
        let items: Vec<_> = event_loop
            .block_on(stream.iter().collect::<Vec<_>>())
            .unwrap();

        assert_eq!(
            items,
            vec![Ok(Chunk::from(json!(1))), Ok(Chunk::from(json!(2))), Ok(Chunk::from(json!(3)))]
        );
        event_loop.run_until_idle();
        assert!(stream.is_destroyed());
    }

    #[test]
    fn test_iteration_surfaces_error() {
        let event_loop = EventLoop::new();
        let source = futures_util::stream::iter(vec![
            Ok(Chunk::from("a")),
            Err(StreamError::custom("source failed")),
        ]);
        let stream = Readable::from_stream(&event_loop, source);
        let items: Vec<_> = event_loop
            .block_on(stream.iter().collect::<Vec<_>>())
            .unwrap();

        assert_eq!(
            items,
            vec![Ok(Chunk::from("a")), Err(StreamError::custom("source failed"))]
        );
    }

    #[test]
    fn test_early_drop_destroys() {
        let event_loop = EventLoop::new();
        let stream = Readable::from_iter(&event_loop, vec!["a", "b", "c"]);
        let first = event_loop.block_on(async {
            let mut iter = stream.iter();
            iter.next().await
        });
        assert_eq!(first, Some(Some(Ok(Chunk::from("a")))));
        event_loop.run_until_idle();
        assert!(stream.is_destroyed());
    }

    #[test]
    fn test_early_drop_can_keep_stream() {
        let event_loop = EventLoop::new();
        let stream = Readable::from_iter(&event_loop, vec!["a", "b", "c"]);
        let first = event_loop.block_on(async {
            let mut iter = stream.iter_with(false);
            iter.next().await
        });
        assert_eq!(first, Some(Some(Ok(Chunk::from("a")))));
        event_loop.run_until_idle();
        assert!(!stream.is_destroyed());

        let rest: Vec<_> = event_loop
            .block_on(stream.iter().collect::<Vec<_>>())
            .unwrap();
        assert_eq!(rest, vec![Ok(Chunk::from("b")), Ok(Chunk::from("c"))]);
    }

    #[test]
    fn test_null_item_is_rejected() {
        let event_loop = EventLoop::new();
        let stream = Readable::from_iter(&event_loop, vec![Chunk::null()]);
        let items: Vec<_> = event_loop
            .block_on(stream.iter().collect::<Vec<_>>())
            .unwrap();
        assert_eq!(items, vec![Err(StreamError::NullValues)]);
    }
}
