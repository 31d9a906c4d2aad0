//! Web-style stream pair and the adapters to and from engine streams.
//!
//! [`WebReadableStream`] and [`WebWritableStream`] are the queue-backed
//! streams used by host layers for request and response bodies. Byte
//! chunks are copied whenever they cross between the two models so that
//! neither side keeps the other's buffers alive.
//!
//! ```ignore
//! let web = readable.to_web();
//! let reader = web.get_reader()?;
//! while let Some(chunk) = reader.read().await? {
//!     body.extend_from_slice(&chunk.to_bytes(Encoding::Utf8)?);
//! }
//! ```

use crate::chunk::Chunk;
use crate::destroy;
use crate::end_of_stream::{FinishedOptions, eos};
use crate::error::{StreamError, StreamResult};
use crate::event_loop::EventLoop;
use crate::events::{EventKind, StreamEvent};
use crate::options::{ReadableOptions, WritableOptions};
use crate::readable::{self, Readable};
use crate::stream::StreamCore;
use crate::writable::{self, Writable};
use bytes::Bytes;
use futures_util::future::poll_fn;
use futures_util::stream::Stream;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};

/// Default queue capacity, in chunks.
const DEFAULT_HIGH_WATER_MARK: usize = 16;

/// State of a web stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebStreamState {
    /// Stream is readable/writable
    Open,
    /// Stream is closed
    Closed,
    /// Stream has errored
    Errored,
}

/// Copy byte payloads so the receiving side owns its buffers.
fn detach(chunk: Chunk) -> Chunk {
    match chunk {
        Chunk::Bytes(b) => Chunk::Bytes(Bytes::copy_from_slice(&b)),
        other => other,
    }
}

type PullFn = Arc<dyn Fn() + Send + Sync>;
type CancelFn = Box<dyn FnOnce(Option<StreamError>) + Send>;

struct ReadableData {
    queue: VecDeque<Chunk>,
    queue_size: usize,
    state: WebStreamState,
    locked: bool,
    high_water_mark: usize,
    /// Count chunks instead of bytes.
    object_mode: bool,
    error: Option<StreamError>,
    waker: Option<Waker>,
    pull: Option<PullFn>,
    cancel: Option<CancelFn>,
}

impl ReadableData {
    fn desired_size(&self) -> isize {
        match self.state {
            WebStreamState::Open => self.high_water_mark as isize - self.queue_size as isize,
            WebStreamState::Closed | WebStreamState::Errored => 0,
        }
    }

    fn pull_if_wanted(&self) -> Option<PullFn> {
        (self.state == WebStreamState::Open && self.desired_size() > 0)
            .then(|| self.pull.clone())
            .flatten()
    }
}

/// Queue-backed readable web stream.
#[derive(Clone)]
pub struct WebReadableStream {
    inner: Arc<Mutex<ReadableData>>,
}

impl std::fmt::Debug for WebReadableStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let data = self.inner.lock();
        f.debug_struct("WebReadableStream")
            .field("state", &data.state)
            .field("queued", &data.queue.len())
            .field("locked", &data.locked)
            .finish()
    }
}

impl Default for WebReadableStream {
    fn default() -> Self {
        Self::new(None)
    }
}

impl WebReadableStream {
    /// Create a stream whose queue holds up to `high_water_mark` chunks
    /// before reporting backpressure.
    pub fn new(high_water_mark: Option<usize>) -> Self {
        Self::with_strategy(high_water_mark.unwrap_or(DEFAULT_HIGH_WATER_MARK), true)
    }

    fn with_strategy(high_water_mark: usize, object_mode: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ReadableData {
                queue: VecDeque::new(),
                queue_size: 0,
                state: WebStreamState::Open,
                locked: false,
                high_water_mark,
                object_mode,
                error: None,
                waker: None,
                pull: None,
                cancel: None,
            })),
        }
    }

    /// Append a chunk for the reader.
    pub fn enqueue(&self, chunk: Chunk) -> StreamResult<()> {
        let waker = {
            let mut data = self.inner.lock();
            if data.state != WebStreamState::Open {
                return Err(StreamError::Closed);
            }
            data.queue_size += chunk.len_in(data.object_mode);
            data.queue.push_back(chunk);
            data.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        Ok(())
    }

    /// Room left before the high-water mark; zero or negative means full.
    pub fn desired_size(&self) -> isize {
        self.inner.lock().desired_size()
    }

    /// No more chunks will be enqueued; queued chunks stay readable.
    pub fn close(&self) -> StreamResult<()> {
        let waker = {
            let mut data = self.inner.lock();
            if data.state != WebStreamState::Open {
                return Err(StreamError::Closed);
            }
            data.state = WebStreamState::Closed;
            data.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        Ok(())
    }

    /// Fail the stream; queued chunks are discarded.
    pub fn error(&self, error: StreamError) {
        let waker = {
            let mut data = self.inner.lock();
            if data.state != WebStreamState::Open {
                return;
            }
            data.state = WebStreamState::Errored;
            data.error = Some(error);
            data.queue.clear();
            data.queue_size = 0;
            data.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Discard everything and tell the source to stop.
    pub fn cancel(&self, reason: Option<StreamError>) {
        let (cancel, waker) = {
            let mut data = self.inner.lock();
            if data.state != WebStreamState::Open {
                return;
            }
            data.state = WebStreamState::Closed;
            data.queue.clear();
            data.queue_size = 0;
            (data.cancel.take(), data.waker.take())
        };
        tracing::debug!(reason = ?reason, "Web readable stream cancelled");
        if let Some(cancel) = cancel {
            cancel(reason);
        }
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    pub fn state(&self) -> WebStreamState {
        self.inner.lock().state
    }

    pub fn is_locked(&self) -> bool {
        self.inner.lock().locked
    }

    /// Number of queued chunks.
    pub fn queue_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Acquire the exclusive reader.
    pub fn get_reader(&self) -> StreamResult<WebReader> {
        let mut data = self.inner.lock();
        if data.locked {
            return Err(StreamError::Locked);
        }
        data.locked = true;
        Ok(WebReader {
            stream: self.clone(),
        })
    }

    fn on_pull(&self, pull: PullFn) {
        self.inner.lock().pull = Some(pull);
    }

    fn on_cancel(&self, cancel: CancelFn) {
        self.inner.lock().cancel = Some(cancel);
    }
}

/// Exclusive reader of a [`WebReadableStream`]; dropping it releases the
/// lock.
#[derive(Debug)]
pub struct WebReader {
    stream: WebReadableStream,
}

impl WebReader {
    /// Next chunk, `None` once the stream is closed and drained.
    pub async fn read(&self) -> StreamResult<Option<Chunk>> {
        poll_fn(|cx| self.poll_read(cx)).await
    }

    /// Like [`read`](Self::read) without waiting: `Ok(None)` also means
    /// "nothing queued yet" while the stream is open.
    pub fn try_read(&self) -> StreamResult<Option<Chunk>> {
        let (result, pull) = {
            let mut data = self.stream.inner.lock();
            if data.state == WebStreamState::Errored {
                return Err(data.error.clone().unwrap_or(StreamError::Closed));
            }
            let chunk = data.queue.pop_front();
            if let Some(chunk) = &chunk {
                data.queue_size = data.queue_size.saturating_sub(chunk.len_in(data.object_mode));
            }
            (chunk, data.pull_if_wanted())
        };
        if let Some(pull) = pull {
            pull();
        }
        Ok(result)
    }

    fn poll_read(&self, cx: &mut Context<'_>) -> Poll<StreamResult<Option<Chunk>>> {
        let (result, pull) = {
            let mut data = self.stream.inner.lock();
            if data.state == WebStreamState::Errored {
                return Poll::Ready(Err(data.error.clone().unwrap_or(StreamError::Closed)));
            }
            match data.queue.pop_front() {
                Some(chunk) => {
                    data.queue_size = data.queue_size.saturating_sub(chunk.len_in(data.object_mode));
                    (Poll::Ready(Ok(Some(chunk))), data.pull_if_wanted())
                }
                None if data.state == WebStreamState::Closed => (Poll::Ready(Ok(None)), None),
                None => {
                    data.waker = Some(cx.waker().clone());
                    (Poll::Pending, data.pull_if_wanted())
                }
            }
        };
        if let Some(pull) = pull {
            pull();
        }
        result
    }

    /// Cancel the underlying stream.
    pub fn cancel(&self, reason: Option<StreamError>) {
        self.stream.cancel(reason);
    }

    /// Give the lock back without cancelling.
    pub fn release_lock(self) {}
}

impl Drop for WebReader {
    fn drop(&mut self) {
        self.stream.inner.lock().locked = false;
    }
}

/// Destination of a [`WebWritableStream`].
pub trait WebSink: Send + Sync {
    /// Accept `chunk`. `Ok(false)` asks the writer to wait until the sink
    /// calls [`WebWritableStream::relieve`].
    fn write(&self, chunk: Chunk) -> StreamResult<bool>;

    fn close(&self) -> StreamResult<()> {
        Ok(())
    }

    fn abort(&self, reason: Option<StreamError>) {
        let _ = reason;
    }
}

struct WritableData {
    chunks: Vec<Chunk>,
    state: WebStreamState,
    locked: bool,
    error: Option<StreamError>,
    backpressure: bool,
    ready_waker: Option<Waker>,
}

/// Writable web stream; collects chunks unless created with a sink.
#[derive(Clone)]
pub struct WebWritableStream {
    inner: Arc<Mutex<WritableData>>,
    sink: Option<Arc<dyn WebSink>>,
}

impl std::fmt::Debug for WebWritableStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let data = self.inner.lock();
        f.debug_struct("WebWritableStream")
            .field("state", &data.state)
            .field("collected", &data.chunks.len())
            .field("locked", &data.locked)
            .field("backpressure", &data.backpressure)
            .finish()
    }
}

impl Default for WebWritableStream {
    fn default() -> Self {
        Self::new()
    }
}

impl WebWritableStream {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(WritableData {
                chunks: Vec::new(),
                state: WebStreamState::Open,
                locked: false,
                error: None,
                backpressure: false,
                ready_waker: None,
            })),
            sink: None,
        }
    }

    pub fn with_sink<S: WebSink + 'static>(sink: S) -> Self {
        Self {
            sink: Some(Arc::new(sink)),
            ..Self::new()
        }
    }

    pub fn state(&self) -> WebStreamState {
        self.inner.lock().state
    }

    pub fn is_locked(&self) -> bool {
        self.inner.lock().locked
    }

    /// The error the stream failed with.
    pub fn stored_error(&self) -> Option<StreamError> {
        self.inner.lock().error.clone()
    }

    /// Chunks written so far, when no sink is attached.
    pub fn chunks(&self) -> Vec<Chunk> {
        self.inner.lock().chunks.clone()
    }

    /// Acquire the exclusive writer.
    pub fn get_writer(&self) -> StreamResult<WebWriter> {
        let mut data = self.inner.lock();
        if data.locked {
            return Err(StreamError::Locked);
        }
        data.locked = true;
        Ok(WebWriter {
            stream: self.clone(),
        })
    }

    /// Whether the sink asked writers to wait.
    pub fn has_backpressure(&self) -> bool {
        self.inner.lock().backpressure
    }

    /// Clear backpressure and wake the writer waiting on it.
    pub fn relieve(&self) {
        let waker = {
            let mut data = self.inner.lock();
            data.backpressure = false;
            data.ready_waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn fail(&self, error: StreamError) {
        let waker = {
            let mut data = self.inner.lock();
            if data.state == WebStreamState::Open {
                data.state = WebStreamState::Errored;
                data.error = Some(error);
            }
            data.ready_waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<StreamResult<()>> {
        let mut data = self.inner.lock();
        if data.state == WebStreamState::Errored {
            return Poll::Ready(Err(data.error.clone().unwrap_or(StreamError::Closed)));
        }
        if data.backpressure {
            data.ready_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        Poll::Ready(Ok(()))
    }

    fn check_open(&self) -> StreamResult<()> {
        let data = self.inner.lock();
        match data.state {
            WebStreamState::Open => Ok(()),
            WebStreamState::Closed => Err(StreamError::Closed),
            WebStreamState::Errored => Err(data.error.clone().unwrap_or(StreamError::Closed)),
        }
    }
}

/// Exclusive writer of a [`WebWritableStream`].
#[derive(Debug)]
pub struct WebWriter {
    stream: WebWritableStream,
}

impl WebWriter {
    /// Resolves once the sink accepts more writes.
    pub async fn ready(&self) -> StreamResult<()> {
        poll_fn(|cx| self.stream.poll_ready(cx)).await
    }

    /// Write `chunk`, resolving once the sink has room again. Writes issued
    /// while the sink is full wait before reaching it.
    pub async fn write(&self, chunk: Chunk) -> StreamResult<()> {
        self.ready().await?;
        self.stream.check_open()?;
        match &self.stream.sink {
            Some(sink) => match sink.write(chunk) {
                Ok(true) => Ok(()),
                Ok(false) => {
                    self.stream.inner.lock().backpressure = true;
                    self.ready().await
                }
                Err(err) => {
                    self.stream.fail(err.clone());
                    Err(err)
                }
            },
            None => {
                self.stream.inner.lock().chunks.push(chunk);
                Ok(())
            }
        }
    }

    pub fn close(&self) -> StreamResult<()> {
        self.stream.check_open()?;
        self.stream.inner.lock().state = WebStreamState::Closed;
        match &self.stream.sink {
            Some(sink) => sink.close(),
            None => Ok(()),
        }
    }

    pub fn abort(&self, reason: Option<StreamError>) {
        if self.stream.check_open().is_err() {
            return;
        }
        self.stream.fail(StreamError::aborted(reason.clone()));
        if let Some(sink) = &self.stream.sink {
            sink.abort(reason);
        }
    }

    /// Give the lock back.
    pub fn release_lock(self) {}
}

impl Drop for WebWriter {
    fn drop(&mut self) {
        self.stream.inner.lock().locked = false;
    }
}

impl Readable {
    /// Expose this readable as a web stream.
    ///
    /// The readable is paused whenever the web queue is full and resumed
    /// when the reader drains it. Cancelling the web stream destroys the
    /// readable.
    pub fn to_web(&self) -> WebReadableStream {
        let core = &self.core;
        let (high_water_mark, object_mode) = {
            let state = core.state.lock();
            (state.r.high_water_mark, state.r.object_mode)
        };
        let web = WebReadableStream::with_strategy(high_water_mark, object_mode);

        readable::pause(core);

        let weak = Arc::downgrade(core);
        let eos_web = web.clone();
        let _watcher = eos(
            core,
            FinishedOptions::new().writable(false),
            Box::new(move |err| match err {
                Some(err) => eos_web.error(err),
                None => {
                    if let Err(err) = eos_web.close() {
                        tracing::debug!(error = %err, "Web stream already settled at end of readable");
                    }
                }
            }),
        );

        let data_web = web.clone();
        let data_core = weak.clone();
        core.add_listener(
            EventKind::Data,
            Arc::new(move |event: &StreamEvent| {
                let StreamEvent::Data(chunk) = event else {
                    return;
                };
                if data_web.enqueue(detach(chunk.clone())).is_err() {
                    return;
                }
                if data_web.desired_size() <= 0
                    && let Some(core) = data_core.upgrade()
                {
                    readable::pause(&core);
                }
            }),
            false,
            false,
        );

        let pull_core = weak.clone();
        web.on_pull(Arc::new(move || {
            if let Some(core) = pull_core.upgrade() {
                readable::resume(&core);
            }
        }));
        web.on_cancel(Box::new(move |reason| {
            if let Some(core) = weak.upgrade() {
                destroy::destroy(&core, reason, None);
            }
        }));

        readable::resume(core);
        tracing::trace!(stream_id = %core.id, "Readable exposed as web stream");
        web
    }

    /// A readable draining `web`. Takes the web stream's reader lock.
    pub fn from_web(event_loop: &EventLoop, web: &WebReadableStream, options: ReadableOptions) -> StreamResult<Self> {
        let reader = web.get_reader()?;
        Ok(Self::from_stream_with(event_loop, WebSource { reader }, options))
    }
}

/// Reader-backed async source; cancels the web stream when dropped early.
struct WebSource {
    reader: WebReader,
}

impl Stream for WebSource {
    type Item = StreamResult<Chunk>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.reader.poll_read(cx) {
            Poll::Ready(Ok(Some(chunk))) => Poll::Ready(Some(Ok(detach(chunk)))),
            Poll::Ready(Ok(None)) => Poll::Ready(None),
            Poll::Ready(Err(err)) => Poll::Ready(Some(Err(err))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for WebSource {
    fn drop(&mut self) {
        self.reader.cancel(None);
    }
}

/// Forwards web writes into an engine writable.
struct WritableSink {
    core: Weak<StreamCore>,
}

impl WritableSink {
    fn core(&self) -> StreamResult<Arc<StreamCore>> {
        self.core.upgrade().ok_or(StreamError::Destroyed("write"))
    }
}

impl WebSink for WritableSink {
    fn write(&self, chunk: Chunk) -> StreamResult<bool> {
        let core = self.core()?;
        let failure = {
            let state = core.state.lock();
            if let Some(err) = &state.w.errored {
                Some(err.clone())
            } else if state.w.destroyed {
                Some(StreamError::Destroyed("write"))
            } else {
                None
            }
        };
        if let Some(err) = failure {
            return Err(err);
        }
        writable::write(&core, detach(chunk), None, None)
    }

    fn close(&self) -> StreamResult<()> {
        let core = self.core()?;
        writable::end(&core, None, None, None);
        Ok(())
    }

    fn abort(&self, reason: Option<StreamError>) {
        if let Ok(core) = self.core() {
            destroy::destroy(&core, Some(StreamError::aborted(reason)), None);
        }
    }
}

impl Writable {
    /// Expose this writable as a web stream. Aborting the web stream
    /// destroys the writable.
    ///
    /// A web write that fills the writable's buffer resolves only after
    /// `drain`.
    pub fn to_web(&self) -> WebWritableStream {
        let web = WebWritableStream::with_sink(WritableSink {
            core: Arc::downgrade(&self.core),
        });
        let drain_web = web.clone();
        self.core.add_listener(
            EventKind::Drain,
            Arc::new(move |_: &StreamEvent| drain_web.relieve()),
            false,
            false,
        );
        let eos_web = web.clone();
        let _watcher = eos(
            &self.core,
            FinishedOptions::new().readable(false),
            Box::new(move |err| match err {
                Some(err) => eos_web.fail(err),
                None => eos_web.relieve(),
            }),
        );
        web
    }

    /// A writable feeding `web`. Takes the web stream's writer lock.
    pub fn from_web(event_loop: &EventLoop, web: &WebWritableStream, options: WritableOptions) -> StreamResult<Self> {
        let writer = Arc::new(web.get_writer()?);
        let write_writer = writer.clone();
        let write_loop = event_loop.clone();
        let final_writer = writer.clone();
        let options = options
            .write(move |_, chunk, _, callback| {
                let writer = write_writer.clone();
                write_loop.spawn(async move { callback(writer.write(detach(chunk)).await.err()) });
            })
            .final_(move |_, callback| callback(final_writer.close().err()))
            .destroy(move |error, callback| {
                if let Some(err) = &error {
                    writer.abort(Some(err.clone()));
                }
                callback(error)
            });
        Ok(Writable::new(event_loop, options))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::NodeStream;
    use serde_json::json;

    #[test]
    fn test_reader_lock() {
        let web = WebReadableStream::new(None);
        let reader = web.get_reader().unwrap();
        assert!(web.is_locked());
        assert_eq!(web.get_reader().err(), Some(StreamError::Locked));
        reader.release_lock();
        assert!(!web.is_locked());
    }

    #[test]
    fn test_enqueue_after_close() {
        let web = WebReadableStream::new(Some(2));
        web.enqueue(Chunk::from("a")).unwrap();
        assert_eq!(web.desired_size(), 1);
        web.close().unwrap();
        assert_eq!(web.enqueue(Chunk::from("b")), Err(StreamError::Closed));

        let reader = web.get_reader().unwrap();
        assert_eq!(reader.try_read(), Ok(Some(Chunk::from("a"))));
        assert_eq!(reader.try_read(), Ok(None));
    }

    #[test]
    fn test_readable_to_web() {
        let event_loop = EventLoop::new();
        let source = Readable::from_iter(&event_loop, vec![json!("a"), json!("b")]);
        let web = source.to_web();
        let reader = web.get_reader().unwrap();

        let collected = event_loop.block_on(async {
            let mut out = Vec::new();
            while let Some(chunk) = reader.read().await? {
                out.push(chunk);
            }
            StreamResult::Ok(out)
        });
        assert_eq!(
            collected,
            Some(Ok(vec![Chunk::from(json!("a")), Chunk::from(json!("b"))]))
        );
        assert_eq!(web.state(), WebStreamState::Closed);
    }

    #[test]
    fn test_readable_from_web_copies_bytes() {
        let event_loop = EventLoop::new();
        let web = WebReadableStream::new(None);
        let original = Bytes::from_static(b"payload");
        web.enqueue(Chunk::Bytes(original.clone())).unwrap();
        web.close().unwrap();

        let readable = Readable::from_web(&event_loop, &web, ReadableOptions::new()).unwrap();
        assert!(web.is_locked());
        let chunks: Vec<_> = event_loop
            .block_on(futures_util::StreamExt::collect::<Vec<_>>(readable.iter()))
            .unwrap();

        assert_eq!(chunks.len(), 1);
        let Ok(Chunk::Bytes(received)) = &chunks[0] else {
            panic!("expected bytes, got {chunks:?}");
        };
        assert_eq!(received, &original);
        assert_ne!(received.as_ptr(), original.as_ptr());
    }

    #[test]
    fn test_web_error_destroys_readable() {
        let event_loop = EventLoop::new();
        let web = WebReadableStream::new(None);
        let readable = Readable::from_web(&event_loop, &web, ReadableOptions::new()).unwrap();
        readable.on(EventKind::Error, |_| {});
        readable.resume();
        event_loop.run_until_idle();

        web.error(StreamError::custom("upstream failed"));
        event_loop.run_until_idle();

        assert!(readable.is_destroyed());
        assert_eq!(readable.errored(), Some(StreamError::custom("upstream failed")));
    }

    #[test]
    fn test_writable_to_web() {
        let event_loop = EventLoop::new();
        let written = Arc::new(Mutex::new(Vec::new()));
        let store = written.clone();
        let dest = Writable::new(
            &event_loop,
            WritableOptions::new().write(move |_, chunk, _, cb| {
                store.lock().push(chunk);
                cb(None)
            }),
        );
        let web = dest.to_web();
        let writer = web.get_writer().unwrap();
        assert_eq!(event_loop.block_on(writer.write(Chunk::from(&b"abc"[..]))), Some(Ok(())));
        writer.close().unwrap();
        event_loop.run_until_idle();

        assert_eq!(*written.lock(), vec![Chunk::from(&b"abc"[..])]);
        assert!(dest.writable_finished());
        assert_eq!(
            event_loop.block_on(writer.write(Chunk::from("late"))),
            Some(Err(StreamError::Closed))
        );
    }

    #[test]
    fn test_web_writer_waits_for_drain() {
        let event_loop = EventLoop::new();
        let parked = Arc::new(Mutex::new(Vec::new()));
        let written = Arc::new(Mutex::new(Vec::new()));
        let (slot, store) = (parked.clone(), written.clone());
        let dest = Writable::new(
            &event_loop,
            WritableOptions::new().high_water_mark(2).write(move |_, chunk, _, cb| {
                store.lock().push(chunk);
                slot.lock().push(cb);
            }),
        );
        let web = dest.to_web();
        let writer = web.get_writer().unwrap();

        let progress = Arc::new(Mutex::new(Vec::new()));
        let steps = progress.clone();
        event_loop.spawn(async move {
            let first = writer.write(Chunk::from(&b"abc"[..])).await;
            steps.lock().push(("first", first));
            let second = writer.write(Chunk::from(&b"d"[..])).await;
            steps.lock().push(("second", second));
        });
        event_loop.run_until_idle();

        assert!(progress.lock().is_empty());
        assert!(web.has_backpressure());
        assert_eq!(written.lock().len(), 1);
        assert_eq!(dest.writable_length(), 3);

        let cb = parked.lock().remove(0);
        cb(None);
        event_loop.run_until_idle();

        assert!(!web.has_backpressure());
        assert_eq!(progress.lock().first(), Some(&("first", Ok(()))));
        assert_eq!(
            *written.lock(),
            vec![Chunk::from(&b"abc"[..]), Chunk::from(&b"d"[..])]
        );
        assert_eq!(progress.lock().len(), 2);
    }

    #[test]
    fn test_writable_from_web() {
        let event_loop = EventLoop::new();
        let web = WebWritableStream::new();
        let dest = Writable::from_web(&event_loop, &web, WritableOptions::new()).unwrap();
        assert_eq!(web.get_writer().err(), Some(StreamError::Locked));

        dest.write("hello").unwrap();
        dest.end();
        event_loop.run_until_idle();

        assert_eq!(web.chunks(), vec![Chunk::from(&b"hello"[..])]);
        assert_eq!(web.state(), WebStreamState::Closed);
        assert!(dest.writable_finished());
    }
}
