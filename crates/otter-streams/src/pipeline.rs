//! Chaining stages into one flow with shared error handling.
//!
//! Consecutive stream stages are connected with `pipe`; async sources and
//! generator stages are pumped with the same backpressure contract. The
//! first error destroys every stage and is reported to the callback, which
//! runs exactly once after every connection settled.

use crate::abort::{AbortController, AbortSignal};
use crate::chunk::Chunk;
use crate::destroy;
use crate::duplex::Duplex;
use crate::end_of_stream::{FinishedOptions, eos};
use crate::error::{StreamError, StreamResult};
use crate::event_loop::EventLoop;
use crate::events::{EventKind, StreamEvent};
use crate::iter::ReadableIter;
use crate::options::{Callback, TransformOptions};
use crate::readable::{self, PipeOptions, Readable};
use crate::stream::{AnyStream, StreamCore};
use crate::transform::Transform;
use crate::writable::{self, Writable};
use futures_util::future::poll_fn;
use futures_util::stream::{BoxStream, Stream, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};

/// Boxed async sequence of chunks flowing between iterable stages.
pub type ChunkStream = BoxStream<'static, StreamResult<Chunk>>;

/// Stage mapping the previous stage's output to a new sequence. The signal
/// fires when the pipeline is torn down.
pub type GeneratorFn = Box<dyn FnOnce(ChunkStream, AbortSignal) -> ChunkStream + Send>;

/// One element of a [`pipeline`].
pub enum Stage {
    Readable(Readable),
    Writable(Writable),
    Duplex(Duplex),
    /// Async source; only valid as the first stage.
    Iterable(ChunkStream),
    /// Async transformation; not valid as the first stage.
    Generator(GeneratorFn),
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Readable(s) => f.debug_tuple("Readable").field(s).finish(),
            Stage::Writable(s) => f.debug_tuple("Writable").field(s).finish(),
            Stage::Duplex(s) => f.debug_tuple("Duplex").field(s).finish(),
            Stage::Iterable(_) => f.write_str("Iterable"),
            Stage::Generator(_) => f.write_str("Generator"),
        }
    }
}

impl Stage {
    pub fn iterable<S>(source: S) -> Self
    where
        S: Stream<Item = StreamResult<Chunk>> + Send + 'static,
    {
        Stage::Iterable(source.boxed())
    }

    pub fn generator<F>(generator: F) -> Self
    where
        F: FnOnce(ChunkStream, AbortSignal) -> ChunkStream + Send + 'static,
    {
        Stage::Generator(Box::new(generator))
    }

    pub(crate) fn core(&self) -> Option<&Arc<StreamCore>> {
        match self {
            Stage::Readable(s) => Some(&s.core),
            Stage::Writable(s) => Some(&s.core),
            Stage::Duplex(s) => Some(&s.core),
            Stage::Iterable(_) | Stage::Generator(_) => None,
        }
    }

    fn produces(&self) -> bool {
        match self {
            Stage::Writable(_) => false,
            Stage::Readable(_) | Stage::Duplex(_) | Stage::Iterable(_) | Stage::Generator(_) => true,
        }
    }

    fn consumes(&self) -> bool {
        match self {
            Stage::Readable(_) | Stage::Iterable(_) => false,
            Stage::Writable(_) | Stage::Duplex(_) | Stage::Generator(_) => true,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Stage::Readable(_) => "Readable",
            Stage::Writable(_) => "Writable",
            Stage::Duplex(_) => "Duplex",
            Stage::Iterable(_) => "Iterable",
            Stage::Generator(_) => "Generator",
        }
    }
}

impl From<Readable> for Stage {
    fn from(value: Readable) -> Self {
        Stage::Readable(value)
    }
}

impl From<Writable> for Stage {
    fn from(value: Writable) -> Self {
        Stage::Writable(value)
    }
}

impl From<Duplex> for Stage {
    fn from(value: Duplex) -> Self {
        Stage::Duplex(value)
    }
}

impl From<Transform> for Stage {
    fn from(value: Transform) -> Self {
        Stage::Duplex(value.into_duplex())
    }
}

impl From<AnyStream> for Stage {
    fn from(value: AnyStream) -> Self {
        match value {
            AnyStream::Readable(s) => Stage::Readable(s),
            AnyStream::Writable(s) => Stage::Writable(s),
            AnyStream::Duplex(s) => Stage::Duplex(s),
        }
    }
}

/// Options of [`pipeline`].
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Tears the whole pipeline down when fired.
    pub signal: Option<AbortSignal>,
    /// End the last stage when the data runs out.
    pub end: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self { signal: None, end: true }
    }
}

impl PipelineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn end(mut self, enabled: bool) -> Self {
        self.end = enabled;
        self
    }
}

struct Destroyer {
    core: Weak<StreamCore>,
    finished: Arc<AtomicBool>,
}

impl Destroyer {
    fn new(core: &Arc<StreamCore>, reading: bool, writing: bool) -> Self {
        let finished = Arc::new(AtomicBool::new(false));
        let on_close = finished.clone();
        core.add_listener(
            EventKind::Close,
            Arc::new(move |_: &StreamEvent| on_close.store(true, Ordering::SeqCst)),
            false,
            false,
        );
        let on_done = finished.clone();
        let _watcher = eos(
            core,
            FinishedOptions::new().readable(reading).writable(writing),
            Box::new(move |err| on_done.store(err.is_none(), Ordering::SeqCst)),
        );
        Self {
            core: Arc::downgrade(core),
            finished,
        }
    }

    fn destroy(self, error: Option<StreamError>) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(core) = self.core.upgrade() {
            let error = error.unwrap_or(StreamError::Destroyed("pipe"));
            destroy::destroy(&core, Some(error), None);
        }
    }
}

struct PipelineState {
    error: Option<StreamError>,
    finish_count: usize,
    destroys: Vec<Destroyer>,
    callback: Option<Callback>,
    outer_listener: Option<(AbortSignal, u64)>,
}

struct Pipeline {
    event_loop: EventLoop,
    controller: AbortController,
    state: Mutex<PipelineState>,
}

impl Pipeline {
    /// One counted connection settled.
    fn finish(&self, error: Option<StreamError>) {
        let last = {
            let mut state = self.state.lock();
            state.finish_count = state.finish_count.saturating_sub(1);
            state.finish_count == 0
        };
        self.finish_impl(error, last);
    }

    fn finish_impl(&self, error: Option<StreamError>, last: bool) {
        let (destroys, callback, outer, error) = {
            let mut state = self.state.lock();
            if let Some(err) = error
                && state.error.as_ref().is_none_or(StreamError::is_premature_close)
            {
                state.error = Some(err);
            }
            if state.error.is_none() && !last {
                return;
            }
            let callback = if last { state.callback.take() } else { None };
            (
                std::mem::take(&mut state.destroys),
                callback,
                state.outer_listener.take(),
                state.error.clone(),
            )
        };

        if let Some(err) = &error {
            tracing::debug!(error = %err, "Pipeline failed, destroying stages");
        }
        for destroyer in destroys {
            destroyer.destroy(error.clone());
        }
        if let Some((signal, id)) = outer {
            signal.remove_listener(id);
        }
        self.controller.abort(None);
        if let Some(callback) = callback {
            self.event_loop.next_tick(move || callback(error));
        }
    }

    fn add_count(&self, n: usize) {
        self.state.lock().finish_count += n;
    }

    fn finisher(self: &Arc<Self>) -> impl FnOnce(Option<StreamError>) + Send + 'static {
        let pipeline = self.clone();
        move |err| pipeline.finish(err)
    }
}

/// Connect `stages` and call `callback` once with the outcome.
///
/// Returns the last stage (an object-mode pass-through when the last stage
/// is a generator). Invalid stage lists are rejected before anything is
/// wired.
pub fn pipeline<F>(
    event_loop: &EventLoop,
    stages: Vec<Stage>,
    options: PipelineOptions,
    callback: F,
) -> StreamResult<AnyStream>
where
    F: FnOnce(Option<StreamError>) + Send + 'static,
{
    validate(&stages)?;
    let count = stages.len();
    let pipeline = Arc::new(Pipeline {
        event_loop: event_loop.clone(),
        controller: AbortController::new(),
        state: Mutex::new(PipelineState {
            error: None,
            finish_count: 0,
            destroys: Vec::new(),
            callback: Some(Box::new(callback)),
            outer_listener: None,
        }),
    });
    tracing::trace!(stages = count, "Building pipeline");

    let mut prev: Option<Output> = None;
    for (i, stage) in stages.into_iter().enumerate() {
        let reading = i < count - 1;
        let writing = i > 0;
        let end = reading || options.end;

        let core = match stage {
            Stage::Iterable(source) => {
                prev = Some(Output::Iter(source));
                continue;
            }
            Stage::Generator(generator) => {
                let input = match prev.take() {
                    Some(Output::Node(src)) => ReadableIter::new(src, true).boxed(),
                    Some(Output::Iter(source)) => source,
                    None => return Err(StreamError::InvalidStage("generator stage without input".into())),
                };
                let output = generator(input, pipeline.controller.signal());
                if reading {
                    prev = Some(Output::Iter(output));
                    continue;
                }
                let pass = Transform::pass_through(event_loop, TransformOptions::new().object_mode(true));
                let core = pass.duplex.core.clone();
                pipeline.add_count(1);
                event_loop.spawn(pump_to_node(pipeline.clone(), output, core.clone(), end));
                let destroyer = Destroyer::new(&core, false, true);
                pipeline.state.lock().destroys.push(destroyer);
                prev = Some(Output::Node(core));
                continue;
            }
            Stage::Readable(s) => s.core,
            Stage::Writable(s) => s.core,
            Stage::Duplex(s) => s.core,
        };

        watch_errors(&pipeline, &core);
        let destroyer = Destroyer::new(&core, reading, writing);
        pipeline.state.lock().destroys.push(destroyer);

        match prev.take() {
            Some(Output::Node(src)) => {
                pipeline.add_count(2);
                pipe(&pipeline, &src, &core, end);
            }
            Some(Output::Iter(source)) => {
                pipeline.add_count(1);
                event_loop.spawn(pump_to_node(pipeline.clone(), source, core.clone(), end));
            }
            None => {}
        }
        prev = Some(Output::Node(core));
    }

    if let Some(signal) = &options.signal {
        let weak = Arc::downgrade(&pipeline);
        let abort_signal = signal.clone();
        let listener = signal.on_abort(move |reason| {
            if let Some(pipeline) = weak.upgrade() {
                pipeline.finish_impl(Some(StreamError::aborted(reason)), false);
            }
        });
        match listener {
            Some(id) => pipeline.state.lock().outer_listener = Some((abort_signal, id)),
            None => {
                let p = pipeline.clone();
                let reason = signal.reason();
                event_loop.next_tick(move || p.finish_impl(Some(StreamError::aborted(reason)), false));
            }
        }
    }

    match prev {
        Some(Output::Node(core)) => Ok(AnyStream::from_core(core)),
        _ => Err(StreamError::InvalidStage("pipeline must end in a stream".into())),
    }
}

enum Output {
    Node(Arc<StreamCore>),
    Iter(ChunkStream),
}

fn validate(stages: &[Stage]) -> StreamResult<()> {
    if stages.len() < 2 {
        return Err(StreamError::MissingArgs("streams"));
    }
    let last = stages.len() - 1;
    for (i, stage) in stages.iter().enumerate() {
        if i > 0 && !stage.consumes() {
            return Err(StreamError::InvalidStage(format!(
                "stage {i} ({}) cannot receive data",
                stage.name()
            )));
        }
        if i < last && !stage.produces() {
            return Err(StreamError::InvalidStage(format!(
                "stage {i} ({}) cannot produce data",
                stage.name()
            )));
        }
        if i == 0 && matches!(stage, Stage::Generator(_)) {
            return Err(StreamError::InvalidStage("generator stage without input".into()));
        }
    }
    Ok(())
}

/// Errors that happen outside a connection still tear the pipeline down.
fn watch_errors(pipeline: &Arc<Pipeline>, core: &Arc<StreamCore>) {
    let weak = Arc::downgrade(pipeline);
    core.add_listener(
        EventKind::Error,
        Arc::new(move |event: &StreamEvent| {
            if let StreamEvent::Error(err) = event
                && !err.is_abort()
                && !err.is_premature_close()
                && let Some(pipeline) = weak.upgrade()
            {
                pipeline.finish_impl(Some(err.clone()), false);
            }
        }),
        false,
        false,
    );
}

/// Runs at most once, whichever event comes first.
fn once_callback(callback: impl FnOnce(Option<StreamError>) + Send + 'static) -> Arc<Mutex<Option<Callback>>> {
    Arc::new(Mutex::new(Some(Box::new(callback))))
}

fn call_once(slot: &Mutex<Option<Callback>>, error: Option<StreamError>) {
    let callback = slot.lock().take();
    if let Some(callback) = callback {
        callback(error);
    }
}

fn pipe(pipeline: &Arc<Pipeline>, src: &Arc<StreamCore>, dst: &Arc<StreamCore>, end: bool) {
    readable::pipe(src, dst, PipeOptions { end: false });

    if end {
        let end_dst = dst.clone();
        let src_finished = src.state.lock().r.is_finished(false);
        if src_finished {
            src.event_loop
                .next_tick(move || writable::end(&end_dst, None, None, None));
        } else {
            src.add_listener(
                EventKind::End,
                Arc::new(move |_: &StreamEvent| writable::end(&end_dst, None, None, None)),
                true,
                false,
            );
        }
        let _watcher = eos(
            dst,
            FinishedOptions::new().readable(false).writable(true),
            Box::new(pipeline.finisher()),
        );
    } else {
        pipeline.finish(None);
    }

    let weak_src = Arc::downgrade(src);
    let finish = pipeline.finisher();
    let _watcher = eos(
        src,
        FinishedOptions::new().readable(true).writable(false),
        Box::new(move |err| {
            let Some(src) = weak_src.upgrade() else {
                finish(err);
                return;
            };
            let ended_cleanly = {
                let state = src.state.lock();
                state.r.ended && state.r.errored.is_none() && !state.r.error_emitted
            };
            if err.as_ref().is_some_and(StreamError::is_premature_close) && ended_cleanly {
                let slot = once_callback(finish);
                let on_end = slot.clone();
                src.add_listener(
                    EventKind::End,
                    Arc::new(move |_: &StreamEvent| call_once(&on_end, None)),
                    true,
                    false,
                );
                src.add_listener(
                    EventKind::Error,
                    Arc::new(move |event: &StreamEvent| {
                        if let StreamEvent::Error(err) = event {
                            call_once(&slot, Some(err.clone()));
                        }
                    }),
                    true,
                    false,
                );
            } else {
                finish(err);
            }
        }),
    );
}

#[derive(Default)]
struct ResumeState {
    error: Option<StreamError>,
    signaled: bool,
    waker: Option<Waker>,
}

/// Wakes a pump waiting for `drain` or completion of its destination.
#[derive(Default)]
struct Resumer {
    state: Mutex<ResumeState>,
}

impl Resumer {
    fn resume(&self, error: Option<StreamError>) {
        let waker = {
            let mut state = self.state.lock();
            if let Some(err) = error {
                state.error = Some(err);
            }
            state.signaled = true;
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    async fn wait(&self) -> StreamResult<()> {
        self.state.lock().signaled = false;
        poll_fn(|cx| {
            let mut state = self.state.lock();
            if let Some(err) = &state.error {
                return Poll::Ready(Err(err.clone()));
            }
            if state.signaled {
                return Poll::Ready(Ok(()));
            }
            state.waker = Some(cx.waker().clone());
            Poll::Pending
        })
        .await
    }

    /// Ready with the error once the destination failed or closed early.
    fn poll_error(&self, cx: &mut Context<'_>) -> Poll<StreamError> {
        let mut state = self.state.lock();
        match &state.error {
            Some(err) => Poll::Ready(err.clone()),
            None => {
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }

    fn error(&self) -> Option<StreamError> {
        self.state.lock().error.clone()
    }
}

/// Write everything `source` yields into `dst`, honoring backpressure.
async fn pump_to_node(pipeline: Arc<Pipeline>, mut source: ChunkStream, dst: Arc<StreamCore>, end: bool) {
    let resumer = Arc::new(Resumer::default());
    let on_drain = resumer.clone();
    let drain_listener = dst.add_listener(
        EventKind::Drain,
        Arc::new(move |_: &StreamEvent| on_drain.resume(None)),
        false,
        false,
    );
    let on_done = resumer.clone();
    let cleanup = eos(
        &dst,
        FinishedOptions::new().readable(false),
        Box::new(move |err| on_done.resume(err)),
    );

    let result: StreamResult<()> = async {
        let need_drain = {
            let state = dst.state.lock();
            !state.w.destroyed && !state.w.ending && state.w.need_drain
        };
        if need_drain {
            resumer.wait().await?;
        }
        loop {
            // Stop once the destination failed, even if the source never yields.
            let next = poll_fn(|cx| match resumer.poll_error(cx) {
                Poll::Ready(err) => Poll::Ready(Some(Err(err))),
                Poll::Pending => source.poll_next_unpin(cx),
            })
            .await;
            let Some(item) = next else {
                break;
            };
            if !writable::write(&dst, item?, None, None)? {
                resumer.wait().await?;
            }
        }
        if end {
            writable::end(&dst, None, None, None);
            resumer.wait().await?;
        }
        Ok(())
    }
    .await;

    drop(source);
    cleanup.run();
    dst.remove_listener(EventKind::Drain, drain_listener);
    match result {
        Ok(()) => pipeline.finish(None),
        Err(err) => {
            let stored = resumer.error();
            let error = if stored.as_ref() == Some(&err) {
                Some(err)
            } else {
                StreamError::aggregate(stored, Some(err))
            };
            pipeline.finish(error);
        }
    }
}
