//! Experiment orchestrator.
//!
//! Drives one run through `Idle -> Starting -> Running -> Stopping ->
//! Completed | Failed`:
//!
//! * **Starting**: both samplers are started concurrently and must report
//!   ready. If either fails, the other is stopped and the run fails without
//!   invoking the load generator.
//! * **Running**: optional pre margin, then the load generator. The load
//!   generator's exit (success, failure, timeout or cancellation) ends the
//!   window, followed by the optional post margin. Sampler health changes
//!   are logged throughout.
//! * **Stopping**: the counter sampler is stopped, then the flow tracker;
//!   each stop returns only after the loop has flushed and exited.
//!
//! Artifacts are written whenever sampling ran, whatever the load outcome.
//! [`Orchestrator::run`] never returns an error: every outcome is a
//! [`RunResult`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::artifacts::{self, RunLog, COUNTERS_FILE, FLOWS_FILE, LOAD_FILE, LOG_FILE, RESULT_FILE};
use super::clock::RunClock;
use super::descriptor::RunDescriptor;
use super::result::{FailureStage, RunArtifacts, RunFailure, RunResult, RunState, RunStatus, SamplerStats};
use crate::config::{NetexpConfig, RunConfig, SamplingConfig};
use crate::monitor::{
    self, CounterSample, CounterSampler, FlowRecord, FlowTracker, LoopSettings, MonitorHandle,
    MonitorOutput, Poller, SamplerHealth,
};
use crate::system::connections::{ConnectionSource, SsCommand};
use crate::system::counters::{CounterSource, ProcNetDev};
use crate::throughput::report::format_summary;
use crate::throughput::{IdleLoad, Iperf3Driver, LoadError, LoadGenerator, LoadRun};

pub struct Orchestrator {
    counters: Arc<dyn CounterSource>,
    connections: Arc<dyn ConnectionSource>,
    load: Arc<dyn LoadGenerator>,
    sampling: SamplingConfig,
    window: RunConfig,
}

/// Per-run lifecycle bookkeeping: current state plus the human-readable log.
struct RunContext<'a> {
    name: &'a str,
    clock: RunClock,
    state: RunState,
    log: RunLog,
}

impl<'a> RunContext<'a> {
    fn new(name: &'a str, clock: RunClock) -> Self {
        Self {
            name,
            clock,
            state: RunState::Idle,
            log: RunLog::new(),
        }
    }

    fn transition(&mut self, to: RunState) {
        info!(run = %self.name, from = %self.state, to = %to, "run state changed");
        let line = format!("state {} -> {}", self.state, to);
        self.note(line);
        self.state = to;
    }

    fn note(&mut self, message: impl AsRef<str>) {
        self.log.record(self.clock.now(), message);
    }

    fn sampler_health(&mut self, sampler: &str, health: SamplerHealth) {
        match health {
            SamplerHealth::Unhealthy {
                consecutive_failures,
            } => {
                warn!(run = %self.name, sampler, consecutive_failures, "sampler reported unhealthy");
                self.note(format!(
                    "{} unhealthy: {} consecutive failed reads",
                    sampler, consecutive_failures
                ));
            }
            SamplerHealth::Healthy => {
                info!(run = %self.name, sampler, "sampler healthy again");
                self.note(format!("{} healthy again", sampler));
            }
        }
    }
}

/// Everything captured between `Running` and the end of `Stopping`.
#[derive(Default)]
struct Captured {
    samples: Vec<CounterSample>,
    flows: Vec<FlowRecord>,
    counter_stats: SamplerStats,
    flow_stats: SamplerStats,
    load: Option<LoadRun>,
    load_started_at: Option<DateTime<Utc>>,
    load_finished_at: Option<DateTime<Utc>>,
    sampler_errors: Vec<String>,
}

fn stats<T>(out: &MonitorOutput<T>) -> SamplerStats {
    SamplerStats {
        records: out.records.len(),
        failed_reads: out.failed_reads,
        became_unhealthy: out.ever_unhealthy,
    }
}

/// Sleep for `wait` unless cancelled first. Returns true if cancelled.
async fn wait_or_cancel(wait: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(wait) => false,
    }
}

/// Health subscriptions of both samplers while the run is in `Running`.
struct HealthWatch {
    counter_name: &'static str,
    counter: watch::Receiver<SamplerHealth>,
    flow_name: &'static str,
    flow: watch::Receiver<SamplerHealth>,
}

impl HealthWatch {
    fn new(counter: &MonitorHandle<CounterSample>, flow: &MonitorHandle<FlowRecord>) -> Self {
        Self {
            counter_name: counter.name(),
            counter: counter.health(),
            flow_name: flow.name(),
            flow: flow.health(),
        }
    }

    /// Drive `work` to completion, noting every health change meanwhile.
    async fn during<F: Future>(&mut self, work: F, ctx: &mut RunContext<'_>) -> F::Output {
        tokio::pin!(work);
        loop {
            tokio::select! {
                out = &mut work => return out,
                Ok(()) = self.counter.changed() => {
                    let health = *self.counter.borrow_and_update();
                    ctx.sampler_health(self.counter_name, health);
                }
                Ok(()) = self.flow.changed() => {
                    let health = *self.flow.borrow_and_update();
                    ctx.sampler_health(self.flow_name, health);
                }
            }
        }
    }
}

impl Orchestrator {
    pub fn new(
        cfg: &NetexpConfig,
        counters: Arc<dyn CounterSource>,
        connections: Arc<dyn ConnectionSource>,
        load: Arc<dyn LoadGenerator>,
    ) -> Self {
        Self {
            counters,
            connections,
            load,
            sampling: cfg.sampling.clone(),
            window: cfg.run.clone(),
        }
    }

    /// Orchestrator backed by `/proc/net/dev`, `ss` and iperf3.
    pub fn for_system(cfg: &NetexpConfig) -> Self {
        Self::new(
            cfg,
            Arc::new(ProcNetDev::default()),
            Arc::new(SsCommand::default()),
            Arc::new(Iperf3Driver::from_config(&cfg.load)),
        )
    }

    /// Monitoring-only capture: the same sampling, no load generator.
    pub fn for_monitoring(cfg: &NetexpConfig) -> Self {
        Self::new(
            cfg,
            Arc::new(ProcNetDev::default()),
            Arc::new(SsCommand::default()),
            Arc::new(IdleLoad),
        )
    }

    /// Execute one run to a terminal state.
    pub async fn run(&self, d: &RunDescriptor, cancel: &CancellationToken) -> RunResult {
        let clock = RunClock::start();
        let mut ctx = RunContext::new(&d.name, clock);
        ctx.note(format!(
            "run '{}': interface {}, {}s, parallel {}, role {}, workload {}",
            d.name,
            d.interface,
            d.duration.as_secs(),
            d.parallel,
            d.role,
            self.load.name()
        ));
        ctx.transition(RunState::Starting);

        if let Err(e) = artifacts::ensure_dir(&d.output_dir) {
            error!(run = %d.name, error = %e, "cannot create run directory");
            let failure = RunFailure::new(FailureStage::Artifacts, "io", format!("{:#}", e));
            return self.finish(ctx, d, false, false, Captured::default(), Some(failure));
        }

        let (counter, flow) = match self.start_samplers(d, clock, cancel, &mut ctx).await {
            Ok(handles) => handles,
            Err(failure) => return self.finish(ctx, d, true, false, Captured::default(), Some(failure)),
        };

        ctx.transition(RunState::Running);
        let captured = self.drive(d, cancel, counter, flow, &mut ctx).await;

        let failure = match captured.load.as_ref().map(|l| &l.outcome) {
            Some(Err(e)) => Some(RunFailure::new(FailureStage::Load, e.kind(), e.to_string())),
            _ if !captured.sampler_errors.is_empty() => Some(RunFailure::new(
                FailureStage::Artifacts,
                "sampler",
                captured.sampler_errors.join("; "),
            )),
            _ => None,
        };

        self.finish(ctx, d, true, true, captured, failure)
    }

    async fn start_samplers(
        &self,
        d: &RunDescriptor,
        clock: RunClock,
        cancel: &CancellationToken,
        ctx: &mut RunContext<'_>,
    ) -> Result<(MonitorHandle<CounterSample>, MonitorHandle<FlowRecord>), RunFailure> {
        let counter_settings = LoopSettings {
            period: self.sampling.counter_period(),
            unhealthy_after: self.sampling.unhealthy_after,
            startup_timeout: self.sampling.startup_timeout(),
        };
        let flow_settings = LoopSettings {
            period: self.sampling.flow_period(),
            ..counter_settings
        };

        let (counter, flow) = tokio::join!(
            monitor::start(
                CounterSampler::new(self.counters.clone(), d.interface.clone()),
                counter_settings,
                clock,
                cancel,
            ),
            monitor::start(
                FlowTracker::new(self.connections.clone())
                    .with_port_filter(self.sampling.flow_ports.clone()),
                flow_settings,
                clock,
                cancel,
            ),
        );

        match (counter, flow) {
            (Ok(counter), Ok(flow)) => {
                ctx.note(format!(
                    "{} ready ({}ms period)",
                    CounterSampler::NAME,
                    counter_settings.period.as_millis()
                ));
                ctx.note(format!(
                    "{} ready ({}ms period)",
                    FlowTracker::NAME,
                    flow_settings.period.as_millis()
                ));
                Ok((counter, flow))
            }
            (counter, flow) => {
                let mut reasons = Vec::new();
                match counter {
                    Ok(h) => {
                        let _ = h.stop().await;
                    }
                    Err(e) => reasons.push(e.to_string()),
                }
                match flow {
                    Ok(h) => {
                        let _ = h.stop().await;
                    }
                    Err(e) => reasons.push(e.to_string()),
                }

                let message = reasons.join("; ");
                let kind = if cancel.is_cancelled() {
                    "cancelled"
                } else {
                    "sampler"
                };
                warn!(run = %d.name, error = %message, "sampler startup failed, load generator not started");
                ctx.note(format!("sampler startup failed: {}", message));
                Err(RunFailure::new(FailureStage::Startup, kind, message))
            }
        }
    }

    /// Running and Stopping. Returns with both samplers stopped.
    async fn drive(
        &self,
        d: &RunDescriptor,
        cancel: &CancellationToken,
        counter: MonitorHandle<CounterSample>,
        flow: MonitorHandle<FlowRecord>,
        ctx: &mut RunContext<'_>,
    ) -> Captured {
        let mut captured = Captured::default();
        let mut health = HealthWatch::new(&counter, &flow);

        let pre = self.window.pre_margin();
        if !pre.is_zero() {
            ctx.note(format!("pre margin {}ms", pre.as_millis()));
            health.during(wait_or_cancel(pre, cancel), ctx).await;
        }

        let load_run = if cancel.is_cancelled() {
            ctx.note("cancelled before load generator start");
            LoadRun::failed(LoadError::Cancelled)
        } else {
            captured.load_started_at = Some(ctx.clock.now());
            ctx.note(format!("load generator '{}' started", self.load.name()));
            let run = health.during(self.load.run(d, cancel), ctx).await;
            captured.load_finished_at = Some(ctx.clock.now());
            run
        };

        match &load_run.outcome {
            Ok(Some(summary)) => ctx.note(format!("load generator completed: {}", format_summary(summary))),
            Ok(None) => ctx.note("workload completed"),
            Err(e) => ctx.note(format!("load generator failed: {}", e)),
        }

        let post = self.window.post_margin();
        if !post.is_zero() && !cancel.is_cancelled() {
            ctx.note(format!("post margin {}ms", post.as_millis()));
            health.during(wait_or_cancel(post, cancel), ctx).await;
        }

        ctx.transition(RunState::Stopping);

        match counter.stop().await {
            Ok(out) => {
                captured.counter_stats = stats(&out);
                ctx.note(format!(
                    "counter sampler stopped: {} samples, {} failed reads",
                    out.records.len(),
                    out.failed_reads
                ));
                captured.samples = out.records;
            }
            Err(e) => {
                error!(run = %d.name, error = %e, "counter sampler did not stop cleanly");
                captured.sampler_errors.push(e.to_string());
            }
        }

        match flow.stop().await {
            Ok(out) => {
                captured.flow_stats = stats(&out);
                let truncated = out.records.iter().filter(|r| r.truncated).count();
                ctx.note(format!(
                    "flow tracker stopped: {} flows ({} truncated), {} failed reads",
                    out.records.len(),
                    truncated,
                    out.failed_reads
                ));
                captured.flows = out.records;
            }
            Err(e) => {
                error!(run = %d.name, error = %e, "flow tracker did not stop cleanly");
                captured.sampler_errors.push(e.to_string());
            }
        }

        captured.load = Some(load_run);
        captured
    }

    /// Write artifacts, reach the terminal state and build the result.
    ///
    /// `dir_ok` is false when the run directory could not be created, in
    /// which case nothing is written. `sampled` is false when the run never
    /// reached `Running`; only the result and log are written then.
    fn finish(
        &self,
        mut ctx: RunContext<'_>,
        d: &RunDescriptor,
        dir_ok: bool,
        sampled: bool,
        captured: Captured,
        mut failure: Option<RunFailure>,
    ) -> RunResult {
        let dir = d.output_dir.clone();
        let mut paths = RunArtifacts {
            dir: dir.clone(),
            ..Default::default()
        };

        if dir_ok && sampled {
            let mut write_errors = Vec::new();

            let path = dir.join(COUNTERS_FILE);
            match artifacts::write_counters(&path, &captured.samples) {
                Ok(()) => paths.counters = Some(path),
                Err(e) => write_errors.push(format!("{:#}", e)),
            }

            let path = dir.join(FLOWS_FILE);
            match artifacts::write_flows(&path, &captured.flows) {
                Ok(()) => paths.flows = Some(path),
                Err(e) => write_errors.push(format!("{:#}", e)),
            }

            if let Some(raw) = captured.load.as_ref().and_then(|l| l.raw_output.as_deref()) {
                let path = dir.join(LOAD_FILE);
                match artifacts::write_text(&path, raw) {
                    Ok(()) => paths.load_output = Some(path),
                    Err(e) => write_errors.push(format!("{:#}", e)),
                }
            }

            if !write_errors.is_empty() {
                let message = write_errors.join("; ");
                error!(run = %d.name, error = %message, "failed to write run artifacts");
                ctx.note(format!("artifact write failed: {}", message));
                failure.get_or_insert_with(|| RunFailure::new(FailureStage::Artifacts, "io", message));
            }
        }

        let final_state = if failure.is_none() {
            RunState::Completed
        } else {
            RunState::Failed
        };
        ctx.transition(final_state);

        let status = if failure.is_none() {
            RunStatus::Success
        } else {
            RunStatus::Failure
        };
        let elapsed = ctx.clock.elapsed();

        if dir_ok {
            paths.result = Some(dir.join(RESULT_FILE));
            paths.log = Some(dir.join(LOG_FILE));
        }

        let load = captured
            .load
            .and_then(|l| l.outcome.ok())
            .flatten();

        let mut result = RunResult {
            name: d.name.clone(),
            status,
            final_state,
            started_at: ctx.clock.started_at(),
            finished_at: ctx.clock.at(elapsed),
            elapsed_secs: elapsed.as_secs_f64(),
            load_started_at: captured.load_started_at,
            load_finished_at: captured.load_finished_at,
            descriptor: Some(d.clone()),
            load,
            failure,
            counters: captured.counter_stats,
            flows: captured.flow_stats,
            truncated_flows: captured.flows.iter().filter(|r| r.truncated).count(),
            artifacts: paths,
        };

        match &result.failure {
            None => info!(run = %d.name, elapsed_secs = result.elapsed_secs, "run completed"),
            Some(f) => warn!(run = %d.name, failure = %f, "run failed"),
        }

        if dir_ok {
            ctx.note(format!(
                "run finished: {} after {:.1}s",
                result.status.as_str(),
                result.elapsed_secs
            ));
            if let Err(e) = ctx.log.write(&dir.join(LOG_FILE)) {
                error!(run = %d.name, error = %e, "failed to write run log");
                result.artifacts.log = None;
                downgrade(&mut result, format!("{:#}", e));
            }
            if let Err(e) = artifacts::write_json(&dir.join(RESULT_FILE), &result) {
                error!(run = %d.name, error = %e, "failed to write run result");
                result.artifacts.result = None;
                downgrade(&mut result, format!("{:#}", e));
            }
        }

        result
    }
}

/// Mark a result failed because its own record could not be written.
fn downgrade(result: &mut RunResult, message: String) {
    result.status = RunStatus::Failure;
    result.final_state = RunState::Failed;
    result
        .failure
        .get_or_insert_with(|| RunFailure::new(FailureStage::Artifacts, "io", message));
}
