//! Cooperative tick queue for stream bookkeeping.
//!
//! Every deferred transition of the stream engine (emitting `readable`,
//! `end`, `close`, completing synchronous writes, resuming a flowing stream)
//! is queued here with [`EventLoop::next_tick`] and runs in FIFO order when the
//! host drives the loop. Listeners attached synchronously after an operation
//! therefore still observe its effects.

use crate::error::StreamError;
use futures_util::task::{ArcWake, waker};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::{Pin, pin};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};

type TickCallback = Box<dyn FnOnce() + Send>;
type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

struct TickEntry {
    id: u64,
    callback: TickCallback,
}

impl std::fmt::Debug for TickEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickEntry").field("id", &self.id).finish()
    }
}

#[derive(Debug, Default)]
struct LoopInner {
    ticks: Mutex<VecDeque<TickEntry>>,
    next_tick_id: AtomicU64,
    executed: AtomicU64,
    /// Errors emitted with no `error` listener attached.
    unhandled: Mutex<Vec<StreamError>>,
}

/// Handle to a tick queue. Cloning shares the queue.
#[derive(Debug, Clone, Default)]
pub struct EventLoop {
    inner: Arc<LoopInner>,
}

impl EventLoop {
    /// Create an empty event loop.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `callback` to run after everything already queued.
    pub fn next_tick<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.inner.next_tick_id.fetch_add(1, Ordering::Relaxed);
        self.inner.ticks.lock().push_back(TickEntry {
            id,
            callback: Box::new(callback),
        });
    }

    /// Run one queued callback. Returns false when the queue was empty.
    pub fn tick(&self) -> bool {
        // Lock released before the callback runs: it may queue more ticks.
        let entry = self.inner.ticks.lock().pop_front();
        match entry {
            Some(entry) => {
                (entry.callback)();
                self.inner.executed.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Run queued callbacks, including ones queued meanwhile, until the queue
    /// is empty. Returns the number of callbacks executed.
    pub fn run_until_idle(&self) -> usize {
        let mut count = 0;
        while self.tick() {
            count += 1;
        }
        count
    }

    /// Number of callbacks waiting to run.
    pub fn pending(&self) -> usize {
        self.inner.ticks.lock().len()
    }

    /// Whether no callbacks are queued.
    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }

    /// Total number of callbacks executed so far.
    pub fn executed(&self) -> u64 {
        self.inner.executed.load(Ordering::Relaxed)
    }

    /// Drive the loop until `future` completes.
    ///
    /// Returns `None` when the future is still pending but nothing is left to
    /// run, i.e. the future can never complete by driving this loop alone.
    pub fn block_on<F: Future>(&self, future: F) -> Option<F::Output> {
        let mut future = pin!(future);
        let flag = Arc::new(WakeFlag(AtomicBool::new(false)));
        let waker = waker(flag.clone());
        let mut cx = Context::from_waker(&waker);

        loop {
            flag.0.store(false, Ordering::SeqCst);
            if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                return Some(output);
            }

            while !flag.0.load(Ordering::SeqCst) {
                if !self.tick() && !flag.0.load(Ordering::SeqCst) {
                    tracing::debug!("block_on stalled: future pending with an idle event loop");
                    return None;
                }
            }
        }
    }

    /// Run `future` on this loop. It is first polled on the next tick and
    /// again on a later tick each time it is woken.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task = Arc::new(Task {
            future: Mutex::new(Some(Box::pin(future))),
            event_loop: self.clone(),
            queued: AtomicBool::new(false),
        });
        ArcWake::wake_by_ref(&task);
    }

    pub(crate) fn report_unhandled(&self, error: StreamError) {
        tracing::error!(error = %error, code = error.code(), "Unhandled stream error");
        self.inner.unhandled.lock().push(error);
    }

    /// Take the errors that were emitted without any `error` listener.
    pub fn take_unhandled_errors(&self) -> Vec<StreamError> {
        std::mem::take(&mut *self.inner.unhandled.lock())
    }
}

struct Task {
    future: Mutex<Option<TaskFuture>>,
    event_loop: EventLoop,
    queued: AtomicBool,
}

impl Task {
    fn run(self: &Arc<Self>) {
        self.queued.store(false, Ordering::SeqCst);
        let Some(mut future) = self.future.lock().take() else {
            return;
        };
        let waker = waker(self.clone());
        let mut cx = Context::from_waker(&waker);
        if future.as_mut().poll(&mut cx).is_pending() {
            *self.future.lock() = Some(future);
        }
    }
}

impl ArcWake for Task {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        if arc_self.queued.swap(true, Ordering::SeqCst) {
            return;
        }
        let task = arc_self.clone();
        arc_self.event_loop.next_tick(move || task.run());
    }
}

struct WakeFlag(AtomicBool);

impl ArcWake for WakeFlag {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.0.store(true, Ordering::SeqCst);
    }
}
