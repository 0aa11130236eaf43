//! # raft-dispatch
//!
//! why: run units of work in order without blocking the caller that submits them
//! relations: used by raft-core to serialize submissions, fan out heartbeats, and deliver applies
//! what: Dispatcher (a fixed pool of FIFO lanes plus dedicated lanes), LaneId, DispatchError

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

/// A zero-argument unit of work.
pub type Job = BoxFuture<'static, ()>;

/// Identifies one lane of the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LaneId(usize);

impl LaneId {
    /// Position of the lane in creation order.
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for LaneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lane-{}", self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("{0} was never created")]
    UnknownLane(LaneId),
    #[error("dispatcher has been shut down")]
    ShutDown,
}

/// Sizing and polling for a [`Dispatcher`].
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Lanes in the default pool used by [`Dispatcher::submit_any`].
    pub lanes: usize,
    /// Upper bound on how long an idle lane sleeps before re-checking its queue.
    pub poll_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            lanes: 10,
            poll_interval: Duration::from_millis(1),
        }
    }
}

struct Lane {
    queue: Mutex<VecDeque<Job>>,
    wake: Notify,
}

impl Lane {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
        }
    }

    fn take_batch(&self) -> VecDeque<Job> {
        std::mem::take(&mut *self.queue.lock())
    }
}

struct Inner {
    lanes: RwLock<Vec<Arc<Lane>>>,
    default_lanes: usize,
    cursor: AtomicUsize,
    shutdown: AtomicBool,
    poll_interval: Duration,
}

/// A set of ordered, independently draining work lanes.
///
/// Work submitted to one lane runs strictly in submission order, one unit at
/// a time; nothing orders work across lanes. Each lane drains its whole
/// backlog as a batch and runs the batch to completion before looking again,
/// so a slow unit only delays its own lane.
///
/// Cloning is cheap and every clone drives the same lanes.
///
/// Must be created inside a tokio runtime: each lane's drain loop is a
/// spawned task.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Create a dispatcher with `config.lanes` default lanes, each already draining.
    pub fn new(config: DispatcherConfig) -> Self {
        let dispatcher = Self {
            inner: Arc::new(Inner {
                lanes: RwLock::new(Vec::with_capacity(config.lanes)),
                default_lanes: config.lanes.max(1),
                cursor: AtomicUsize::new(0),
                shutdown: AtomicBool::new(false),
                poll_interval: config.poll_interval,
            }),
        };
        for _ in 0..dispatcher.inner.default_lanes {
            dispatcher.new_lane();
        }
        dispatcher
    }

    /// Add a lane outside the default pool and start draining it.
    ///
    /// Dedicated lanes are never picked by [`Dispatcher::submit_any`].
    pub fn new_lane(&self) -> LaneId {
        let lane = Arc::new(Lane::new());
        let id = {
            let mut lanes = self.inner.lanes.write();
            lanes.push(Arc::clone(&lane));
            LaneId(lanes.len() - 1)
        };
        tokio::spawn(drain(Arc::clone(&self.inner), id, lane));
        debug!(%id, "lane started");
        id
    }

    /// Enqueue `work` at the back of `lane`. Never blocks.
    pub fn submit<F>(&self, lane: LaneId, work: F) -> Result<(), DispatchError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_shut_down() {
            return Err(DispatchError::ShutDown);
        }
        let target = self.lane(lane)?;
        target.queue.lock().push_back(work.boxed());
        target.wake.notify_one();
        Ok(())
    }

    /// Enqueue `work` on the next default lane, round robin.
    ///
    /// For work whose order relative to other work does not matter.
    pub fn submit_any<F>(&self, work: F) -> Result<LaneId, DispatchError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let slot = self.inner.cursor.fetch_add(1, Ordering::Relaxed) % self.inner.default_lanes;
        let lane = LaneId(slot);
        self.submit(lane, work)?;
        Ok(lane)
    }

    /// Drop every queued, not yet started unit of `lane`.
    ///
    /// Work the lane is already running is not interrupted. Returns how many
    /// units were dropped.
    pub fn purge(&self, lane: LaneId) -> Result<usize, DispatchError> {
        let dropped = self.lane(lane)?.take_batch().len();
        debug!(%lane, dropped, "lane purged");
        Ok(dropped)
    }

    /// Purge every lane.
    pub fn purge_all(&self) -> usize {
        let lanes = self.inner.lanes.read().clone();
        let dropped: usize = lanes.iter().map(|lane| lane.take_batch().len()).sum();
        debug!(dropped, "all lanes purged");
        dropped
    }

    /// Purge every lane and stop all drain loops.
    ///
    /// Loops exit within one poll interval; a unit already running finishes.
    /// Later submissions fail with [`DispatchError::ShutDown`].
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.purge_all();
        for lane in self.inner.lanes.read().iter() {
            lane.wake.notify_one();
        }
        debug!("dispatcher shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// Units queued on `lane` and not yet picked up by its drain loop.
    pub fn pending(&self, lane: LaneId) -> Result<usize, DispatchError> {
        Ok(self.lane(lane)?.queue.lock().len())
    }

    /// Total lanes, default pool plus dedicated lanes.
    pub fn lane_count(&self) -> usize {
        self.inner.lanes.read().len()
    }

    fn lane(&self, id: LaneId) -> Result<Arc<Lane>, DispatchError> {
        self.inner
            .lanes
            .read()
            .get(id.0)
            .cloned()
            .ok_or(DispatchError::UnknownLane(id))
    }
}

async fn drain(inner: Arc<Inner>, id: LaneId, lane: Arc<Lane>) {
    loop {
        if inner.shutdown.load(Ordering::SeqCst) {
            break;
        }
        let batch = lane.take_batch();
        if batch.is_empty() {
            tokio::select! {
                _ = lane.wake.notified() => {}
                _ = tokio::time::sleep(inner.poll_interval) => {}
            }
            continue;
        }
        trace!(%id, units = batch.len(), "draining batch");
        for job in batch {
            if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                warn!(%id, "unit of work panicked");
            }
        }
    }
    debug!(%id, "lane stopped");
}
