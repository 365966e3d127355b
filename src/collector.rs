//! The aggregation engine: bounded ingress queue, single-writer folding task, periodic
//! expiration task, and the registry index they both operate on.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use quanta::Clock;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::registry_index::RegistryIndex;
use crate::sample::{InvalidSample, Sample};
use crate::selfmetrics::{DropReason, SelfMetrics};
use crate::vector::VectorConflict;

const CREATED: u8 = 0;
const RUNNING: u8 = 1;
const STOPPING: u8 = 2;
const STOPPED: u8 = 3;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WriteError {
    #[error("ingress queue is full")]
    QueueFull,
    #[error("collector is not running")]
    NotRunning,
}

#[derive(Debug, Error)]
pub enum StopError {
    #[error("folding task did not exit within the shutdown window")]
    ShutdownTimeout,
}

/// The core fold-and-expire engine described in the design: one bounded queue, one folding
/// task, one expiration task, fanning into a shared [`RegistryIndex`].
pub struct Collector {
    index: Arc<RegistryIndex>,
    self_metrics: Arc<SelfMetrics>,
    clock: Clock,
    sender: mpsc::Sender<Sample>,
    receiver: parking_lot::Mutex<Option<mpsc::Receiver<Sample>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    state: AtomicU8,
    expiration_ttl: Duration,
    expiration_tick: Duration,
    tasks_done: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
    started_at: parking_lot::Mutex<Option<quanta::Instant>>,
}

impl Collector {
    pub fn new(
        index: Arc<RegistryIndex>,
        self_metrics: Arc<SelfMetrics>,
        queue_size: usize,
        expiration_ttl: Duration,
        expiration_tick: Duration,
    ) -> Collector {
        let (sender, receiver) = mpsc::channel(queue_size);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Collector {
            index,
            self_metrics,
            clock: Clock::new(),
            sender,
            receiver: parking_lot::Mutex::new(Some(receiver)),
            shutdown_tx,
            shutdown_rx,
            state: AtomicU8::new(CREATED),
            expiration_ttl,
            expiration_tick,
            tasks_done: parking_lot::Mutex::new(Vec::new()),
            started_at: parking_lot::Mutex::new(None),
        }
    }

    /// Non-blocking enqueue. Never suspends, never reorders, never drops silently once
    /// accepted onto the channel.
    pub fn write(&self, sample: Sample) -> Result<(), WriteError> {
        if self.state.load(Ordering::Acquire) != RUNNING {
            return Err(WriteError::NotRunning);
        }
        self.sender.try_send(sample).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => WriteError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => WriteError::NotRunning,
        })
    }

    /// Launches the folding task and the expiration task. Idempotent only in the sense that
    /// calling it twice panics in debug builds on the receiver already being taken; the state
    /// machine otherwise guards against concurrent starts via `compare_exchange`.
    pub fn start(self: &Arc<Self>) {
        self.state
            .compare_exchange(CREATED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .expect("Collector::start called more than once");

        self.self_metrics.mark_started(unix_seconds_now());
        *self.started_at.lock() = Some(self.clock.now());

        let receiver = self.receiver.lock().take().expect("receiver already taken");
        let fold_handle = tokio::spawn(Self::fold_loop(Arc::clone(self), receiver, self.shutdown_rx.clone()));
        let expire_handle = tokio::spawn(Self::expire_loop(Arc::clone(self), self.shutdown_rx.clone()));
        *self.tasks_done.lock() = vec![fold_handle, expire_handle];
    }

    /// Requests shutdown and waits up to `window` for both background tasks to exit.
    pub async fn stop(&self, window: Duration) -> Result<(), StopError> {
        self.state.store(STOPPING, Ordering::Release);
        let _ = self.shutdown_tx.send(true);

        let handles = std::mem::take(&mut *self.tasks_done.lock());
        let joined = tokio::time::timeout(window, futures_join_all(handles)).await;

        self.state.store(STOPPED, Ordering::Release);
        joined.map(|_| ()).map_err(|_| StopError::ShutdownTimeout)
    }

    pub fn registry_for(&self, service: &str) -> Option<Arc<crate::registry::Registry>> {
        self.index.lookup(service)
    }

    pub fn self_metrics(&self) -> &Arc<SelfMetrics> {
        &self.self_metrics
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Time elapsed since `Start`, or zero if the collector has not started yet.
    pub fn uptime(&self) -> Duration {
        match *self.started_at.lock() {
            Some(started) => self.clock.now().saturating_duration_since(started),
            None => Duration::ZERO,
        }
    }

    async fn fold_loop(self_: Arc<Collector>, mut receiver: mpsc::Receiver<Sample>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let sample = tokio::select! {
                sample = receiver.recv() => sample,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            let Some(sample) = sample else { break };
            self_.self_metrics.set_queue_length(receiver.len());
            self_.fold_one(sample);
        }
        debug!("folding task exiting");
    }

    fn fold_one(&self, sample: Sample) {
        let started = self.clock.now();

        if sample.service == crate::registry_index::SELF_METRICS_SERVICE {
            self.reject(&sample.kind_raw, InvalidSample::ReservedServiceName(sample.service.clone()));
            return;
        }

        let kind = match sample.validate_common() {
            Ok(kind) => kind,
            Err(err) => {
                self.reject(&sample.kind_raw, err);
                return;
            }
        };

        let buckets = match sample.resolve_buckets(kind) {
            Ok(buckets) => buckets,
            Err(err) => {
                self.reject(&sample.kind_raw, err);
                return;
            }
        };

        let registry = self.index.registry_for(&sample.service);
        if let Err(conflict) = registry.fold(&sample, kind, buckets, &self.clock) {
            self.reject_conflict(kind, conflict);
        }

        let elapsed = self.clock.now().saturating_duration_since(started);
        self.self_metrics.record_processing(kind.as_str(), elapsed);
    }

    fn reject(&self, kind_raw: &str, err: InvalidSample) {
        debug!(kind = kind_raw, error = %err, "rejected invalid sample");
        self.self_metrics.record_drop(DropReason::InvalidSample);
    }

    fn reject_conflict(&self, kind: crate::sample::SampleKind, err: VectorConflict) {
        debug!(kind = kind.as_str(), error = %err, "rejected conflicting sample");
        self.self_metrics.record_drop(DropReason::KindConflict);
    }

    async fn expire_loop(self_: Arc<Collector>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self_.expiration_tick);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self_.expire_once();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("expiration task exiting");
    }

    fn expire_once(&self) {
        let now = self.clock.now();
        for service in self.index.service_names() {
            let Some(registry) = self.index.lookup(&service) else { continue };
            let started = self.clock.now();
            let dropped = registry.expire(now, self.expiration_ttl);
            if dropped > 0 {
                info!(service = %service, dropped, "expired idle label children");
            }
            let elapsed = self.clock.now().saturating_duration_since(started);
            self.self_metrics.record_expiring(&service, elapsed);
        }
    }
}

fn unix_seconds_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// A tiny stand-in for `futures::future::join_all`, since this crate doesn't otherwise need
/// the `futures` dependency: await each handle in turn, logging (not propagating) task panics.
async fn futures_join_all(handles: Vec<tokio::task::JoinHandle<()>>) {
    for handle in handles {
        if let Err(err) = handle.await {
            warn!(error = %err, "background task panicked");
        }
    }
}
