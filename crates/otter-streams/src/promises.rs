//! Future-returning forms of [`finished`](crate::finished) and
//! [`pipeline`](crate::pipeline()).
//!
//! The futures complete from event-loop ticks, so drive them with
//! [`EventLoop::block_on`] or from a task spawned on the same loop.

use crate::end_of_stream::{self, FinishedOptions};
use crate::error::{StreamError, StreamResult};
use crate::event_loop::EventLoop;
use crate::pipeline::{self, PipelineOptions, Stage};
use crate::stream::NodeStream;
use std::future::Future;
use tokio::sync::oneshot;

fn settle(receiver: oneshot::Receiver<Option<StreamError>>) -> impl Future<Output = StreamResult<()>> {
    async move {
        match receiver.await {
            Ok(None) => Ok(()),
            Ok(Some(err)) => Err(err),
            // The callback was dropped unfired: the watcher went away.
            Err(_) => Err(StreamError::PrematureClose),
        }
    }
}

/// Resolves when `stream` completed, or fails with the reason it did not.
pub fn finished<S>(stream: &S, options: FinishedOptions) -> impl Future<Output = StreamResult<()>> + use<S>
where
    S: NodeStream + ?Sized,
{
    let (sender, receiver) = oneshot::channel();
    let _cleanup = end_of_stream::finished(stream, options, move |err| {
        let _ = sender.send(err);
    });
    settle(receiver)
}

/// Wire `stages` up and resolve once the whole pipeline settled.
///
/// Stage validation errors are returned by the future as well.
pub fn pipeline(
    event_loop: &EventLoop,
    stages: Vec<Stage>,
    options: PipelineOptions,
) -> impl Future<Output = StreamResult<()>> + use<> {
    let (sender, receiver) = oneshot::channel();
    let wired = pipeline::pipeline(event_loop, stages, options, move |err| {
        let _ = sender.send(err);
    });
    async move {
        wired?;
        settle(receiver).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;
    use crate::options::{ReadableOptions, WritableOptions};
    use crate::readable::Readable;
    use crate::writable::Writable;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_finished_resolves() {
        let event_loop = EventLoop::new();
        let stream = Readable::from_iter(&event_loop, vec!["a"]);
        let done = finished(&stream, FinishedOptions::new());
        stream.resume();
        assert_eq!(event_loop.block_on(done), Some(Ok(())));
    }

    #[test]
    fn test_finished_rejects_on_premature_close() {
        let event_loop = EventLoop::new();
        let stream = Readable::new(&event_loop, ReadableOptions::new().read(|_, _| Ok(())));
        let done = finished(&stream, FinishedOptions::new());
        stream.destroy(None);
        assert_eq!(event_loop.block_on(done), Some(Err(StreamError::PrematureClose)));
    }

    #[test]
    fn test_pipeline_resolves() {
        let event_loop = EventLoop::new();
        let written = Arc::new(Mutex::new(Vec::new()));
        let store = written.clone();
        let source = Readable::from_iter(&event_loop, vec!["a", "b"]);
        let dest = Writable::new(
            &event_loop,
            WritableOptions::new().object_mode(true).write(move |_, chunk, _, cb| {
                store.lock().push(chunk);
                cb(None)
            }),
        );

        let done = pipeline(&event_loop, vec![source.into(), dest.into()], PipelineOptions::new());
        assert_eq!(event_loop.block_on(done), Some(Ok(())));
        assert_eq!(*written.lock(), vec![Chunk::from("a"), Chunk::from("b")]);
    }

    #[test]
    fn test_pipeline_validation_error() {
        let event_loop = EventLoop::new();
        let source = Readable::from_iter(&event_loop, vec!["a"]);
        let done = pipeline(&event_loop, vec![source.into()], PipelineOptions::new());
        assert_eq!(
            event_loop.block_on(done),
            Some(Err(StreamError::MissingArgs("streams")))
        );
    }
}
