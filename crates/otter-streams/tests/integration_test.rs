//! Integration tests for otter-streams.
//!
//! These tests drive streams through the public API only and check the
//! flow-control guarantees end to end: buffer accounting, backpressure,
//! completion, error propagation across pipelines and the web boundary.

use otter_streams::{
    AbortController, BufferList, Callback, Chunk, Duplex, DuplexOptions, Encoding, EventKind,
    EventLoop, FinishedOptions, NodeStream, PipelineOptions, Readable, ReadableOptions, Stage,
    StreamError, StreamEvent, Transform, TransformOptions, WebReadableStream, Writable,
    WritableOptions, compose, finished, pipeline, promises,
};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn counter<S: NodeStream>(stream: &S, kind: EventKind) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    stream.on(kind, move |_| {
        c.fetch_add(1, Ordering::SeqCst);
    });
    count
}

fn collecting_sink(event_loop: &EventLoop, options: WritableOptions) -> (Writable, Arc<Mutex<Vec<Chunk>>>) {
    let written = Arc::new(Mutex::new(Vec::new()));
    let store = written.clone();
    let stream = Writable::new(
        event_loop,
        options.write(move |_, chunk, _, cb| {
            store.lock().push(chunk);
            cb(None)
        }),
    );
    (stream, written)
}

/// Buffer accounting of the read queue.
mod buffer_tests {
    use super::*;

    #[test]
    fn test_partial_consume() {
        let mut list = BufferList::new(false);
        list.push(Chunk::from(&b"ab"[..]));
        list.push(Chunk::from(&b"cde"[..]));
        assert_eq!(list.len(), 5);

        let taken = list.consume(4, false);
        assert_eq!(taken, Some(Chunk::from(&b"abcd"[..])));
        assert_eq!(list.count(), 1);
        assert_eq!(list.first(), Some(&Chunk::from(&b"e"[..])));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_length_tracks_push_and_read() {
        let event_loop = EventLoop::new();
        let stream = Readable::new(&event_loop, ReadableOptions::new().read(|_, _| Ok(())));

        stream.push(Some(Chunk::from("abc")));
        assert_eq!(stream.readable_length(), 3);
        stream.push(Some(Chunk::from("de")));
        assert_eq!(stream.readable_length(), 5);

        assert_eq!(stream.read(Some(2)), Some(Chunk::from(&b"ab"[..])));
        assert_eq!(stream.readable_length(), 3);
        assert_eq!(stream.read(Some(3)), Some(Chunk::from(&b"cde"[..])));
        assert_eq!(stream.readable_length(), 0);
        assert_eq!(stream.read(Some(1)), None);
        assert_eq!(stream.readable_length(), 0);
    }

    #[test]
    fn test_object_mode_counts_chunks() {
        let event_loop = EventLoop::new();
        let stream = Readable::new(
            &event_loop,
            ReadableOptions::new().object_mode(true).read(|_, _| Ok(())),
        );
        stream.push(Some(Chunk::from(json!({"id": 1}))));
        stream.push(Some(Chunk::from("long text counts as one")));
        assert_eq!(stream.readable_length(), 2);
        assert_eq!(stream.read(None), Some(Chunk::from(json!({"id": 1}))));
        assert_eq!(stream.readable_length(), 1);
    }
}

/// Readable end-of-data and destroy protocol.
mod readable_tests {
    use super::*;

    #[test]
    fn test_end_emitted_once() {
        let event_loop = EventLoop::new();
        let stream = Readable::new(&event_loop, ReadableOptions::new().read(|_, _| Ok(())));
        let ends = counter(&stream, EventKind::End);

        stream.push(Some(Chunk::from("x")));
        stream.push(None);
        stream.push(None);
        stream.resume();
        event_loop.run_until_idle();
        stream.push(None);
        event_loop.run_until_idle();

        assert_eq!(ends.load(Ordering::SeqCst), 1);
        assert!(stream.readable_ended());
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let event_loop = EventLoop::new();
        let hook_calls = Arc::new(AtomicUsize::new(0));
        let calls = hook_calls.clone();
        let stream = Readable::new(
            &event_loop,
            ReadableOptions::new()
                .read(|_, _| Ok(()))
                .destroy(move |err, cb| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    cb(err)
                }),
        );
        let closes = counter(&stream, EventKind::Close);
        let errors = counter(&stream, EventKind::Error);

        stream.destroy(Some(StreamError::custom("first")));
        stream.destroy(Some(StreamError::custom("second")));
        event_loop.run_until_idle();

        assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(stream.errored(), Some(StreamError::custom("first")));
    }

    #[test]
    fn test_pipe_moves_everything() {
        let event_loop = EventLoop::new();
        let source = Readable::from_iter(&event_loop, vec!["a", "b", "c"]);
        let (dest, written) = collecting_sink(&event_loop, WritableOptions::new().object_mode(true));
        let finishes = counter(&dest, EventKind::Finish);

        source.pipe(&dest);
        event_loop.run_until_idle();

        assert_eq!(
            *written.lock(),
            vec![Chunk::from("a"), Chunk::from("b"), Chunk::from("c")]
        );
        assert_eq!(finishes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pipe_waits_for_every_destination_to_drain() {
        let event_loop = EventLoop::new();
        let source = Readable::new(
            &event_loop,
            ReadableOptions::new().object_mode(true).read(|_, _| Ok(())),
        );
        let parked_sink = || {
            let written = Arc::new(Mutex::new(Vec::new()));
            let pending: Arc<Mutex<Vec<Callback>>> = Arc::new(Mutex::new(Vec::new()));
            let (store, parked) = (written.clone(), pending.clone());
            let sink = Writable::new(
                &event_loop,
                WritableOptions::new()
                    .object_mode(true)
                    .high_water_mark(1)
                    .write(move |_, chunk, _, cb| {
                        store.lock().push(chunk);
                        parked.lock().push(cb);
                    }),
            );
            (sink, written, pending)
        };
        let (sink_a, written_a, pending_a) = parked_sink();
        let (sink_b, written_b, pending_b) = parked_sink();

        source.pipe(&sink_a);
        source.pipe(&sink_b);
        source.push(Some(Chunk::from("x")));
        event_loop.run_until_idle();
        source.push(Some(Chunk::from("y")));
        event_loop.run_until_idle();

        assert_eq!(*written_a.lock(), vec![Chunk::from("x")]);
        assert_eq!(*written_b.lock(), vec![Chunk::from("x")]);
        assert_eq!(source.readable_flowing(), Some(false));

        let cb = pending_a.lock().remove(0);
        cb(None);
        event_loop.run_until_idle();

        assert_eq!(source.readable_flowing(), Some(false));
        assert_eq!(written_a.lock().len(), 1);
        assert_eq!(written_b.lock().len(), 1);

        let cb = pending_b.lock().remove(0);
        cb(None);
        event_loop.run_until_idle();

        assert_eq!(*written_a.lock(), vec![Chunk::from("x"), Chunk::from("y")]);
        assert_eq!(*written_b.lock(), vec![Chunk::from("x"), Chunk::from("y")]);
    }
}

/// Writable buffering and the drain handshake.
mod writable_tests {
    use super::*;

    #[test]
    fn test_drain_wakes_writer_once() {
        let event_loop = EventLoop::new();
        let pending: Arc<Mutex<Vec<Callback>>> = Arc::new(Mutex::new(Vec::new()));
        let parked = pending.clone();
        let stream = Writable::new(
            &event_loop,
            WritableOptions::new()
                .high_water_mark(3)
                .write(move |_, _, _, cb| parked.lock().push(cb)),
        );
        let drains = counter(&stream, EventKind::Drain);
        let completed = Arc::new(AtomicUsize::new(0));

        let c = completed.clone();
        assert_eq!(
            stream.write_with("ab", None, move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            Ok(true)
        );
        let c = completed.clone();
        assert_eq!(
            stream.write_with("cd", None, move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            Ok(false)
        );
        assert!(stream.writable_need_drain());

        loop {
            event_loop.run_until_idle();
            let next = pending.lock().pop();
            match next {
                Some(cb) => cb(None),
                None => break,
            }
        }

        assert_eq!(drains.load(Ordering::SeqCst), 1);
        assert_eq!(completed.load(Ordering::SeqCst), 2);
        assert!(!stream.writable_need_drain());
        assert_eq!(stream.writable_length(), 0);
    }

    #[test]
    fn test_write_after_end_reports_error() {
        let event_loop = EventLoop::new();
        let (stream, _) = collecting_sink(&event_loop, WritableOptions::new());
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        stream.on(EventKind::Error, move |event| {
            if let StreamEvent::Error(err) = event {
                sink.lock().push(err.clone());
            }
        });

        stream.end();
        let result = Arc::new(Mutex::new(None));
        let slot = result.clone();
        assert_eq!(
            stream.write_with("late", None, move |err| *slot.lock() = Some(err)),
            Ok(false)
        );
        event_loop.run_until_idle();

        assert_eq!(*errors.lock(), vec![StreamError::WriteAfterEnd]);
        assert_eq!(*result.lock(), Some(Some(StreamError::WriteAfterEnd)));
    }
}

/// Duplex halves and half-open behavior.
mod duplex_tests {
    use super::*;

    fn quiet_duplex(event_loop: &EventLoop, allow_half_open: bool) -> Duplex {
        Duplex::new(
            event_loop,
            DuplexOptions::new()
                .allow_half_open(allow_half_open)
                .read(|_, _| Ok(()))
                .write(|_, _, _, cb| cb(None)),
        )
    }

    #[test]
    fn test_half_open_keeps_readable() {
        let event_loop = EventLoop::new();
        let duplex = quiet_duplex(&event_loop, true);
        let ends = counter(&duplex, EventKind::End);
        duplex.resume();

        duplex.end();
        event_loop.run_until_idle();

        assert!(duplex.writable_finished());
        assert!(!duplex.readable_ended());
        assert_eq!(ends.load(Ordering::SeqCst), 0);
        assert!(!duplex.is_destroyed());

        duplex.push(None);
        event_loop.run_until_idle();
        assert_eq!(ends.load(Ordering::SeqCst), 1);
        assert!(duplex.is_destroyed());
    }

    #[test]
    fn test_closed_half_ends_readable() {
        let event_loop = EventLoop::new();
        let duplex = quiet_duplex(&event_loop, false);
        let ends = counter(&duplex, EventKind::End);
        duplex.resume();

        duplex.end();
        event_loop.run_until_idle();

        assert_eq!(ends.load(Ordering::SeqCst), 1);
        assert!(duplex.is_closed());
    }
}

/// Transform credit coupling between the halves.
mod transform_tests {
    use super::*;

    #[test]
    fn test_credit_throttles_unread_transform() {
        let event_loop = EventLoop::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let stream = Transform::new(
            &event_loop,
            TransformOptions::new()
                .object_mode(true)
                .high_water_mark(2)
                .transform(move |_, _, _, cb| {
                    c.fetch_add(1, Ordering::SeqCst);
                    cb(Ok(None))
                }),
        );

        let results: Vec<bool> = (0..5)
            .map(|i| stream.write(json!(i)).unwrap())
            .collect();
        assert_eq!(results, vec![true, true, false, false, false]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        event_loop.run_until_idle();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // A pending read keeps the credit open for the whole backlog.
        stream.read(Some(0));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(stream.writable_length(), 0);
    }

    #[test]
    fn test_transform_round_trip_with_reader() {
        let event_loop = EventLoop::new();
        let doubler = Transform::new(
            &event_loop,
            TransformOptions::new().object_mode(true).transform(|_, chunk, _, cb| {
                let n = chunk.as_value().and_then(|v| v.as_i64()).unwrap_or(0);
                cb(Ok(Some(Chunk::from(json!(n * 2)))))
            }),
        );
        let out = Arc::new(Mutex::new(Vec::new()));
        let sink = out.clone();
        doubler.on(EventKind::Data, move |event| {
            if let StreamEvent::Data(chunk) = event {
                sink.lock().push(chunk.clone());
            }
        });
        for n in 1..=4 {
            doubler.write(json!(n)).unwrap();
        }
        doubler.end();
        event_loop.run_until_idle();

        assert_eq!(
            *out.lock(),
            (1..=4).map(|n| Chunk::from(json!(n * 2))).collect::<Vec<_>>()
        );
    }
}

/// Pipeline, compose and completion detection.
mod pipeline_tests {
    use super::*;

    #[test]
    fn test_middle_stage_failure() {
        let event_loop = EventLoop::new();
        let source = Readable::from_iter(&event_loop, vec![json!(1), json!(2)]);
        let failing = Transform::new(
            &event_loop,
            TransformOptions::new()
                .object_mode(true)
                .transform(|_, _, _, cb| cb(Err(StreamError::custom("sink rejected")))),
        );
        let (dest, _) = collecting_sink(&event_loop, WritableOptions::new().object_mode(true));
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let store = outcomes.clone();

        pipeline(
            &event_loop,
            vec![source.clone().into(), failing.into(), dest.clone().into()],
            PipelineOptions::new(),
            move |err| store.lock().push(err),
        )
        .unwrap();
        event_loop.run_until_idle();

        assert_eq!(*outcomes.lock(), vec![Some(StreamError::custom("sink rejected"))]);
        assert!(source.is_destroyed());
        assert!(dest.is_destroyed());
        assert!(event_loop.take_unhandled_errors().is_empty());
    }

    #[test]
    fn test_abort_cancels_pipeline() {
        let event_loop = EventLoop::new();
        let controller = AbortController::new();
        let source = Readable::new(&event_loop, ReadableOptions::new().read(|_, _| Ok(())));
        let (dest, _) = collecting_sink(&event_loop, WritableOptions::new());
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let store = outcomes.clone();

        pipeline(
            &event_loop,
            vec![source.clone().into(), dest.clone().into()],
            PipelineOptions::new().signal(controller.signal()),
            move |err| store.lock().push(err),
        )
        .unwrap();
        controller.abort(Some(StreamError::custom("user left")));
        event_loop.run_until_idle();

        let outcomes = outcomes.lock();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(
            outcomes[0],
            Some(StreamError::aborted(Some(StreamError::custom("user left"))))
        );
        assert!(source.is_destroyed());
        assert!(dest.is_destroyed());
    }

    #[test]
    fn test_generator_stage_between_streams() {
        let event_loop = EventLoop::new();
        let source = Readable::from_iter(&event_loop, vec!["a", "b"]);
        let (dest, written) = collecting_sink(&event_loop, WritableOptions::new().object_mode(true));
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let store = outcomes.clone();

        pipeline(
            &event_loop,
            vec![
                source.into(),
                Stage::generator(|input, _| {
                    use futures_util::StreamExt;
                    input
                        .map(|item| item.map(|chunk| Chunk::from(chunk.to_text(Encoding::Utf8).repeat(2))))
                        .boxed()
                }),
                dest.into(),
            ],
            PipelineOptions::new(),
            move |err| store.lock().push(err),
        )
        .unwrap();
        event_loop.run_until_idle();

        assert_eq!(*outcomes.lock(), vec![None]);
        assert_eq!(*written.lock(), vec![Chunk::from("aa"), Chunk::from("bb")]);
    }

    #[test]
    fn test_compose_behaves_like_one_stream() {
        let event_loop = EventLoop::new();
        let parse = Transform::new(
            &event_loop,
            TransformOptions::new()
                .writable_object_mode(false)
                .readable_object_mode(true)
                .transform(|_, chunk, _, cb| {
                    let text = chunk.to_text(Encoding::Utf8);
                    cb(Ok(Some(Chunk::from(json!(text.len())))))
                }),
        );
        let pass = Transform::pass_through(&event_loop, TransformOptions::new().object_mode(true));
        let composite = compose(&event_loop, vec![parse.into(), pass.into()]).unwrap();
        assert!(composite.readable_object_mode());
        assert!(!composite.writable_object_mode());

        composite.write("four").unwrap();
        composite.end();
        event_loop.run_until_idle();
        assert_eq!(composite.read(None), Some(Chunk::from(json!(4))));
    }

    #[test]
    fn test_finished_reports_premature_close() {
        let event_loop = EventLoop::new();
        let (dest, _) = collecting_sink(&event_loop, WritableOptions::new());
        let outcome = Arc::new(Mutex::new(Vec::new()));
        let store = outcome.clone();
        let _cleanup = finished(&dest, FinishedOptions::new(), move |err| store.lock().push(err));

        dest.write("partial").unwrap();
        dest.destroy(None);
        event_loop.run_until_idle();

        assert_eq!(*outcome.lock(), vec![Some(StreamError::PrematureClose)]);
    }
}

/// Future-returning helpers.
mod promises_tests {
    use super::*;

    #[tokio::test]
    async fn test_pipeline_future_resolves() {
        let event_loop = EventLoop::new();
        let source = Readable::from_iter(&event_loop, vec!["x", "y"]);
        let (dest, written) = collecting_sink(&event_loop, WritableOptions::new().object_mode(true));

        let done = promises::pipeline(
            &event_loop,
            vec![source.into(), dest.into()],
            PipelineOptions::new(),
        );
        assert_eq!(event_loop.block_on(done), Some(Ok(())));
        assert_eq!(written.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_finished_future_rejects() {
        let event_loop = EventLoop::new();
        let stream = Readable::new(&event_loop, ReadableOptions::new().read(|_, _| Ok(())));
        stream.on(EventKind::Error, |_| {});
        let done = promises::finished(&stream, FinishedOptions::new());
        stream.destroy(Some(StreamError::custom("gone")));
        assert_eq!(
            event_loop.block_on(done),
            Some(Err(StreamError::custom("gone")))
        );
    }
}

/// Async iteration and the web boundary.
mod iteration_tests {
    use super::*;
    use futures_util::StreamExt;

    #[test]
    fn test_iterate_readable() {
        let event_loop = EventLoop::new();
        let stream = Readable::from_iter(&event_loop, vec![json!("a"), json!("b")]);
        let items: Vec<_> = event_loop
            .block_on(stream.iter().map(|item| item.unwrap()).collect::<Vec<_>>())
            .unwrap();
        assert_eq!(items, vec![Chunk::from(json!("a")), Chunk::from(json!("b"))]);
    }

    #[test]
    fn test_web_round_trip() {
        let event_loop = EventLoop::new();
        let source = Readable::from_iter(&event_loop, vec!["one", "two"]);
        let web = source.to_web();
        let back = Readable::from_web(
            &event_loop,
            &web,
            ReadableOptions::new().object_mode(true),
        )
        .unwrap();
        let items: Vec<_> = event_loop
            .block_on(back.iter().collect::<Vec<_>>())
            .unwrap();
        assert_eq!(items, vec![Ok(Chunk::from("one")), Ok(Chunk::from("two"))]);
    }

    #[test]
    fn test_cancel_web_destroys_source() {
        let event_loop = EventLoop::new();
        let source = Readable::new(&event_loop, ReadableOptions::new().read(|_, _| Ok(())));
        let web: WebReadableStream = source.to_web();
        web.cancel(None);
        event_loop.run_until_idle();
        assert!(source.is_destroyed());
    }
}
