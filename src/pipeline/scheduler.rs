//! Worker scheduling.
//!
//! Nodes never run their own worker; they ask a [`WorkerTrigger`] for a pass.
//! [`Scheduler`] provides two modes:
//!
//! - **threaded**: a pool of worker threads pulls triggered nodes from a
//!   crossbeam channel, and a timer thread re-triggers nodes that asked to be
//!   called back after a delay.
//! - **manual**: nothing runs until the owner pumps the scheduler with
//!   [`Scheduler::run_until_idle`] or [`Scheduler::pump`]. Used by tests and
//!   single-threaded embeddings.
//!
//! The scheduler only holds `Weak<Node>`; a dropped node simply stops being
//! scheduled.

use crate::config::SchedulerSettings;
use crate::error::{MediaFlowError, Result};
use crate::pipeline::behavior::WorkStatus;
use crate::pipeline::node::Node;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// How long idle worker and timer threads sleep before re-checking shutdown.
const IDLE_POLL: Duration = Duration::from_millis(50);

/// Something that can run worker passes for nodes.
pub trait WorkerTrigger: Send + Sync {
    /// Run a pass of `node` soon, or after `delay`.
    fn schedule(&self, node: Weak<Node>, delay: Option<Duration>);

    /// True if passes run on other threads. Synchronous callers that would
    /// otherwise wait for the worker run it inline when this is false.
    fn is_threaded(&self) -> bool;
}

struct Timer {
    due: Instant,
    seq: u64,
    node: Weak<Node>,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    // Reversed so the max-heap pops the earliest deadline.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// State shared by the scheduler, its threads and every node it drives.
struct Inner {
    threaded: bool,
    running: AtomicBool,
    jobs_tx: Sender<Weak<Node>>,
    jobs_rx: Receiver<Weak<Node>>,
    timers: Mutex<BinaryHeap<Timer>>,
    timer_cv: Condvar,
    next_seq: AtomicU64,
    passes: AtomicU64,
}

impl Inner {
    fn new(threaded: bool) -> Self {
        let (jobs_tx, jobs_rx) = unbounded();
        Self {
            threaded,
            running: AtomicBool::new(true),
            jobs_tx,
            jobs_rx,
            timers: Mutex::new(BinaryHeap::new()),
            timer_cv: Condvar::new(),
            next_seq: AtomicU64::new(0),
            passes: AtomicU64::new(0),
        }
    }

    fn run_job(&self, weak: Weak<Node>) {
        let Some(node) = weak.upgrade() else {
            return;
        };
        let status = node.run_scheduled();
        self.passes.fetch_add(1, Ordering::Relaxed);
        self.follow_up(&node, weak, status);
    }

    fn follow_up(&self, node: &Node, weak: Weak<Node>, status: WorkStatus) {
        if status.more_work {
            node.trigger();
        } else if let Some(delay) = status.next_call {
            self.schedule(weak, Some(delay));
        }
    }

    fn add_timer(&self, node: Weak<Node>, delay: Duration) {
        let due = Instant::now() + delay;
        let mut timers = self.timers.lock();
        // An earlier callback for the same node already covers this one.
        if timers.iter().any(|t| t.node.ptr_eq(&node) && t.due <= due) {
            return;
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        timers.push(Timer { due, seq, node });
        drop(timers);
        self.timer_cv.notify_one();
    }

    /// Trigger every node whose deadline has passed. Returns the next deadline.
    fn fire_due_timers(&self) -> Option<Instant> {
        let now = Instant::now();
        let mut due = Vec::new();
        let next = {
            let mut timers = self.timers.lock();
            while timers.peek().is_some_and(|t| t.due <= now) {
                if let Some(t) = timers.pop() {
                    due.push(t.node);
                }
            }
            timers.peek().map(|t| t.due)
        };
        for weak in due {
            if let Some(node) = weak.upgrade() {
                trace!("timer fired for {}", node.id());
                node.trigger();
            }
        }
        next
    }

    fn worker_loop(&self, index: usize) {
        debug!("scheduler worker {} started", index);
        while self.running.load(Ordering::Acquire) {
            match self.jobs_rx.recv_timeout(IDLE_POLL) {
                Ok(weak) => self.run_job(weak),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("scheduler worker {} exiting", index);
    }

    fn timer_loop(&self) {
        debug!("scheduler timer started");
        while self.running.load(Ordering::Acquire) {
            self.fire_due_timers();
            let mut timers = self.timers.lock();
            if !self.running.load(Ordering::Acquire) {
                break;
            }
            match timers.peek().map(|t| t.due) {
                Some(due) if due > Instant::now() => {
                    self.timer_cv.wait_until(&mut timers, due);
                }
                Some(_) => {}
                None => {
                    self.timer_cv.wait_for(&mut timers, IDLE_POLL);
                }
            }
        }
        debug!("scheduler timer exiting");
    }
}

impl WorkerTrigger for Inner {
    fn schedule(&self, node: Weak<Node>, delay: Option<Duration>) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        match delay {
            Some(delay) if !delay.is_zero() => self.add_timer(node, delay),
            _ => {
                if self.jobs_tx.send(node).is_err() {
                    debug!("scheduler queue closed, pass dropped");
                }
            }
        }
    }

    fn is_threaded(&self) -> bool {
        self.threaded
    }
}

/// Owner of the scheduling threads (if any).
///
/// Nodes hold the trigger returned by [`Scheduler::trigger`], never the
/// scheduler itself, so dropping the last node never joins a thread from
/// inside a worker.
pub struct Scheduler {
    inner: Arc<Inner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Build from settings: threaded with `threads` workers, or manual.
    pub fn new(settings: &SchedulerSettings) -> Result<Self> {
        if settings.multithreaded {
            Self::threaded(settings.threads)
        } else {
            Ok(Self::manual())
        }
    }

    /// Scheduler that only runs when pumped by its owner.
    pub fn manual() -> Self {
        info!("Using manual scheduler");
        Self {
            inner: Arc::new(Inner::new(false)),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Scheduler with `workers` worker threads and one timer thread.
    pub fn threaded(workers: usize) -> Result<Self> {
        let inner = Arc::new(Inner::new(true));
        let mut threads = Vec::with_capacity(workers + 1);
        for index in 0..workers.max(1) {
            let shared = inner.clone();
            let handle = std::thread::Builder::new()
                .name(format!("mediaflow-worker-{}", index))
                .spawn(move || shared.worker_loop(index))
                .map_err(|e| MediaFlowError::Scheduler(format!("spawn worker: {}", e)))?;
            threads.push(handle);
        }
        let shared = inner.clone();
        let timer = std::thread::Builder::new()
            .name("mediaflow-timer".into())
            .spawn(move || shared.timer_loop())
            .map_err(|e| MediaFlowError::Scheduler(format!("spawn timer: {}", e)))?;
        threads.push(timer);

        info!("Started threaded scheduler with {} worker(s)", workers.max(1));
        Ok(Self {
            inner,
            threads: Mutex::new(threads),
        })
    }

    /// Handle to give to nodes.
    pub fn trigger(&self) -> Arc<dyn WorkerTrigger> {
        self.inner.clone()
    }

    pub fn is_threaded(&self) -> bool {
        self.inner.threaded
    }

    /// Total worker passes run so far.
    pub fn passes(&self) -> u64 {
        self.inner.passes.load(Ordering::Relaxed)
    }

    /// Manual mode: run queued passes (and due timers) on the calling thread
    /// until nothing is runnable or `max_passes` were run. Returns the number
    /// of passes run. A no-op in threaded mode.
    pub fn run_until_idle(&self, max_passes: usize) -> usize {
        if self.inner.threaded {
            return 0;
        }
        let mut passes = 0;
        while passes < max_passes {
            self.inner.fire_due_timers();
            match self.inner.jobs_rx.try_recv() {
                Ok(weak) => {
                    self.inner.run_job(weak);
                    passes += 1;
                }
                Err(_) => break,
            }
        }
        passes
    }

    /// Manual mode: keep running passes, sleeping until timers come due,
    /// until `done` returns true or `budget` runs out. Returns whether `done`
    /// was satisfied. In threaded mode this only polls `done`.
    pub fn pump(&self, budget: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + budget;
        loop {
            if !self.inner.threaded {
                self.run_until_idle(usize::MAX);
            }
            if done() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let next = if self.inner.threaded {
                None
            } else {
                self.inner.timers.lock().peek().map(|t| t.due)
            };
            let wake = next.unwrap_or(now + Duration::from_millis(1)).min(deadline);
            if wake > now {
                std::thread::sleep(wake - now);
            }
        }
    }

    /// Stop every thread. Queued passes are dropped.
    pub fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.inner.timer_cv.notify_all();
        let current = std::thread::current().id();
        let threads: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        for handle in threads {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                debug!("scheduler thread panicked");
            }
        }
        self.inner.timers.lock().clear();
        while self.inner.jobs_rx.try_recv().is_ok() {}
        info!("Scheduler stopped after {} pass(es)", self.passes());
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("threaded", &self.inner.threaded)
            .field("passes", &self.passes())
            .finish()
    }
}
