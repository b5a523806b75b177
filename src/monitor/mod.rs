//! Periodic sampling loops.
//!
//! Both samplers are polling tasks: a fixed-period interval, one collaborator
//! read per tick, and an explicit stop signal. The first successful read is
//! the readiness signal. After that, failed reads are logged and counted but
//! never end the loop; a streak of `unhealthy_after` failures flips the
//! published [`SamplerHealth`] until a read succeeds again.
//!
//! Records are owned by the loop task and handed back to the caller by
//! [`MonitorHandle::stop`], which returns only after the loop has exited.

pub mod counter;
pub mod flow;

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::experiment::clock::RunClock;

pub use counter::{CounterSample, CounterSampler};
pub use flow::{FlowRecord, FlowTable, FlowTracker};

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("interface '{interface}' not found (available: {})", .available.join(", "))]
    InterfaceNotFound {
        interface: String,
        available: Vec<String>,
    },

    #[error("collaborator read failed: {0}")]
    Read(String),

    #[error("malformed collaborator output: {0}")]
    Parse(String),

    #[error("read did not complete within {0:?}")]
    Timeout(Duration),

    #[error("{sampler} failed to start: {reason}")]
    Startup {
        sampler: &'static str,
        reason: String,
    },

    #[error("{0} task ended abnormally")]
    Join(&'static str),
}

/// Health published by a running sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum SamplerHealth {
    Healthy,
    Unhealthy { consecutive_failures: u32 },
}

/// Timing policy for one sampling loop.
#[derive(Debug, Clone, Copy)]
pub struct LoopSettings {
    pub period: Duration,
    pub unhealthy_after: u32,
    pub startup_timeout: Duration,
}

/// One sampling source driven by [`start`].
#[async_trait::async_trait]
pub trait Poller: Send + 'static {
    type Record: Send + 'static;

    /// Name used in logs and errors.
    const NAME: &'static str;

    /// Take one reading at `now`.
    async fn poll(&mut self, now: DateTime<Utc>, elapsed: Duration) -> Result<(), MonitorError>;

    /// Flush everything collected so far; `now` is the stop time.
    fn finish(self, now: DateTime<Utc>) -> Vec<Self::Record>;
}

/// What a sampler hands back at stop.
#[derive(Debug)]
pub struct MonitorOutput<T> {
    pub records: Vec<T>,
    pub ticks: u64,
    pub failed_reads: u64,
    pub ever_unhealthy: bool,
}

/// Running sampler. Dropping the handle without calling
/// [`MonitorHandle::stop`] cancels the loop but discards its records.
pub struct MonitorHandle<T> {
    name: &'static str,
    cancel: CancellationToken,
    health: watch::Receiver<SamplerHealth>,
    task: JoinHandle<MonitorOutput<T>>,
}

impl<T> MonitorHandle<T> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Subscribe to health changes.
    pub fn health(&self) -> watch::Receiver<SamplerHealth> {
        self.health.clone()
    }

    /// Signal the loop to stop and wait for it to flush and exit.
    pub async fn stop(mut self) -> Result<MonitorOutput<T>, MonitorError> {
        self.cancel.cancel();
        let name = self.name;
        let out = (&mut self.task).await.map_err(|_| MonitorError::Join(name))?;
        debug!(sampler = name, records = out.records.len(), "sampler stopped");
        Ok(out)
    }
}

impl<T> Drop for MonitorHandle<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Spawn `poller` on a fixed-period loop and wait until it reports ready.
///
/// Fails with [`MonitorError::Startup`] if the first read fails, does not
/// finish within `startup_timeout`, or `abort` fires first. In every failure
/// case the loop task has exited before this returns.
pub async fn start<P: Poller>(
    poller: P,
    settings: LoopSettings,
    clock: RunClock,
    abort: &CancellationToken,
) -> Result<MonitorHandle<P::Record>, MonitorError> {
    let cancel = CancellationToken::new();
    let (ready_tx, ready_rx) = oneshot::channel();
    let (health_tx, health_rx) = watch::channel(SamplerHealth::Healthy);

    let task = tokio::spawn(run_loop(poller, settings, clock, cancel.clone(), ready_tx, health_tx));
    let handle = MonitorHandle {
        name: P::NAME,
        cancel,
        health: health_rx,
        task,
    };

    let ready = tokio::select! {
        r = ready_rx => r,
        _ = abort.cancelled() => {
            let _ = handle.stop().await;
            return Err(MonitorError::Startup {
                sampler: P::NAME,
                reason: "cancelled before first reading".to_string(),
            });
        }
    };

    match ready {
        Ok(Ok(())) => {
            info!(sampler = P::NAME, period_ms = settings.period.as_millis() as u64, "sampler ready");
            Ok(handle)
        }
        Ok(Err(e)) => {
            let _ = handle.stop().await;
            Err(MonitorError::Startup {
                sampler: P::NAME,
                reason: e.to_string(),
            })
        }
        Err(_) => {
            let _ = handle.stop().await;
            Err(MonitorError::Startup {
                sampler: P::NAME,
                reason: "loop exited before first reading".to_string(),
            })
        }
    }
}

async fn run_loop<P: Poller>(
    mut poller: P,
    settings: LoopSettings,
    clock: RunClock,
    cancel: CancellationToken,
    ready_tx: oneshot::Sender<Result<(), MonitorError>>,
    health_tx: watch::Sender<SamplerHealth>,
) -> MonitorOutput<P::Record> {
    let mut interval = tokio::time::interval(settings.period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut ready_tx = Some(ready_tx);
    let mut streak = FailureStreak::new(settings.unhealthy_after, health_tx);
    let mut ticks = 0u64;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let elapsed = clock.elapsed();
        let now = clock.at(elapsed);
        let budget = if ready_tx.is_some() {
            settings.startup_timeout
        } else {
            settings.period
        };

        let result = match tokio::time::timeout(budget, poller.poll(now, elapsed)).await {
            Ok(r) => r,
            Err(_) => Err(MonitorError::Timeout(budget)),
        };
        ticks += 1;

        match result {
            Ok(()) => {
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(Ok(()));
                }
                streak.success(P::NAME);
            }
            Err(e) => {
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(Err(e));
                    return MonitorOutput {
                        records: Vec::new(),
                        ticks,
                        failed_reads: 1,
                        ever_unhealthy: false,
                    };
                }
                warn!(sampler = P::NAME, error = %e, "sampling tick failed, continuing");
                streak.failure(P::NAME);
            }
        }
    }

    MonitorOutput {
        records: poller.finish(clock.now()),
        ticks,
        failed_reads: streak.total,
        ever_unhealthy: streak.ever_unhealthy,
    }
}

/// Consecutive-failure bookkeeping behind [`SamplerHealth`].
struct FailureStreak {
    threshold: u32,
    consecutive: u32,
    total: u64,
    ever_unhealthy: bool,
    health: watch::Sender<SamplerHealth>,
}

impl FailureStreak {
    fn new(threshold: u32, health: watch::Sender<SamplerHealth>) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive: 0,
            total: 0,
            ever_unhealthy: false,
            health,
        }
    }

    fn success(&mut self, name: &'static str) {
        if self.consecutive >= self.threshold {
            info!(sampler = name, "sampler recovered");
            self.health.send_replace(SamplerHealth::Healthy);
        }
        self.consecutive = 0;
    }

    fn failure(&mut self, name: &'static str) {
        self.consecutive += 1;
        self.total += 1;
        if self.consecutive >= self.threshold {
            if self.consecutive == self.threshold {
                warn!(sampler = name, failures = self.consecutive, "sampler unhealthy");
            }
            self.ever_unhealthy = true;
            self.health.send_replace(SamplerHealth::Unhealthy {
                consecutive_failures: self.consecutive,
            });
        }
    }
}
