//! Batch runs end to end against in-process collaborators. Time is paused,
//! so multi-second runs and cool-downs complete instantly.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use netexp::batch::{BatchRunner, SUMMARY_CSV, SUMMARY_JSON};
use netexp::config::NetexpConfig;
use netexp::experiment::{Orchestrator, RunDescriptor, RunStatus};
use netexp::monitor::MonitorError;
use netexp::system::connections::{ConnectionSource, Endpoint, FlowKey};
use netexp::system::counters::{CounterSource, InterfaceCounters};
use netexp::throughput::{LoadError, LoadGenerator, LoadRun, LoadSummary};
use tokio_util::sync::CancellationToken;

struct GrowingCounters {
    reads: AtomicUsize,
}

#[async_trait::async_trait]
impl CounterSource for GrowingCounters {
    async fn read(&self, interface: &str) -> Result<InterfaceCounters, MonitorError> {
        if interface != "eth0" {
            return Err(MonitorError::InterfaceNotFound {
                interface: interface.to_string(),
                available: vec!["eth0".to_string()],
            });
        }
        let n = self.reads.fetch_add(1, Ordering::SeqCst) as u64;
        Ok(InterfaceCounters {
            bytes_sent: n * 1_000_000,
            bytes_recv: n * 10_000,
            packets_sent: n * 700,
            packets_recv: n * 300,
            ..Default::default()
        })
    }
}

struct OneConnection;

#[async_trait::async_trait]
impl ConnectionSource for OneConnection {
    async fn snapshot(&self) -> Result<HashSet<FlowKey>, MonitorError> {
        let key = FlowKey::tcp(
            Endpoint::parse("10.0.0.2:40000").ok_or_else(|| MonitorError::Parse("local".into()))?,
            Endpoint::parse("10.0.0.1:5201").ok_or_else(|| MonitorError::Parse("remote".into()))?,
        );
        Ok(HashSet::from([key]))
    }
}

/// Fails every run whose name starts with `fail`.
struct NamedLoad {
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl LoadGenerator for NamedLoad {
    fn name(&self) -> &str {
        "named"
    }

    async fn run(&self, d: &RunDescriptor, _cancel: &CancellationToken) -> LoadRun {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(d.duration).await;
        if d.name.starts_with("fail") {
            return LoadRun::failed(LoadError::Exit {
                code: Some(1),
                stderr: "iperf3: error - unable to connect to server".to_string(),
            });
        }
        LoadRun {
            outcome: Ok(Some(LoadSummary {
                protocol: "TCP".to_string(),
                streams: d.parallel,
                duration_secs: d.duration.as_secs_f64(),
                bytes_sent: 125_000_000,
                bytes_received: 125_000_000,
                sent_bps: 500_000_000.0,
                received_bps: 499_000_000.0,
                retransmits: Some(3),
                jitter_ms: None,
                lost_percent: None,
            })),
            raw_output: Some("{\"start\":{},\"end\":{}}".to_string()),
        }
    }
}

fn runner(load: Arc<NamedLoad>) -> BatchRunner {
    let orchestrator = Orchestrator::new(
        &NetexpConfig::default(),
        Arc::new(GrowingCounters {
            reads: AtomicUsize::new(0),
        }),
        Arc::new(OneConnection),
        load,
    );
    BatchRunner::new(orchestrator, Duration::from_secs(3))
}

fn write_descriptor(dir: &Path, file: &str, body: &str) {
    std::fs::write(dir.join(file), body).unwrap();
}

fn three_descriptors(dir: &Path) {
    write_descriptor(dir, "01-first.toml", "name = \"first\"\nduration_secs = 2\ninterface = \"eth0\"\n");
    write_descriptor(dir, "02-fail.toml", "name = \"fail-second\"\nduration_secs = 2\ninterface = \"eth0\"\n");
    write_descriptor(
        dir,
        "03-third.json",
        r#"{"name": "third", "duration_secs": 2, "interface": "eth0", "parallel": 4}"#,
    );
}

#[tokio::test(start_paused = true)]
async fn test_failed_run_does_not_stop_batch() {
    let input = tempfile::TempDir::new().unwrap();
    let output = tempfile::TempDir::new().unwrap();
    three_descriptors(input.path());

    let load = Arc::new(NamedLoad {
        calls: AtomicUsize::new(0),
    });
    let summary = runner(load.clone())
        .run(input.path(), output.path(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(load.calls.load(Ordering::SeqCst), 3);
    assert_eq!(summary.total, 3);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 1);
    assert!(!summary.all_succeeded());

    let names: Vec<_> = summary.runs.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["first", "fail-second", "third"]);
    assert_eq!(summary.runs[1].status, RunStatus::Failure);
    assert!(summary.runs[1]
        .failure
        .as_deref()
        .unwrap()
        .contains("unable to connect"));
    assert_eq!(summary.runs[2].status, RunStatus::Success);
    assert!(summary.runs[2].counter_samples > 0);

    // the failed run still leaves its partial evidence behind
    let failed_dir = output.path().join("fail-second");
    assert!(failed_dir.join("result.json").exists());
    assert!(failed_dir.join("run.log").exists());
    assert!(failed_dir.join("counters.csv").exists());
}

#[tokio::test(start_paused = true)]
async fn test_invalid_descriptor_is_counted_as_failure() {
    let input = tempfile::TempDir::new().unwrap();
    let output = tempfile::TempDir::new().unwrap();
    write_descriptor(input.path(), "a.toml", "name = \"a\"\nduration_secs = 1\ninterface = \"eth0\"\n");
    write_descriptor(input.path(), "b.toml", "name = \"b\"\nduration_secs = 1\n");
    write_descriptor(input.path(), "c.toml", "name = \"c\"\nduration_secs = 1\ninterface = \"wlan9\"\n");
    write_descriptor(input.path(), "notes.txt", "ignored");

    let load = Arc::new(NamedLoad {
        calls: AtomicUsize::new(0),
    });
    let summary = runner(load.clone())
        .run(input.path(), output.path(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.total, 3);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 2);
    // b never reached the load generator; c failed sampler startup
    assert_eq!(load.calls.load(Ordering::SeqCst), 1);

    let rejected = std::fs::read_to_string(output.path().join("b").join("result.json")).unwrap();
    let v: serde_json::Value = serde_json::from_str(&rejected).unwrap();
    assert_eq!(v["status"], "failure");
    assert_eq!(v["failure"]["stage"], "descriptor");
}

#[tokio::test(start_paused = true)]
async fn test_invalid_file_does_not_overwrite_run_with_same_name() {
    let input = tempfile::TempDir::new().unwrap();
    let output = tempfile::TempDir::new().unwrap();
    write_descriptor(input.path(), "a.toml", "name = \"b\"\nduration_secs = 1\ninterface = \"eth0\"\n");
    write_descriptor(input.path(), "b.toml", "duration_secs = 1\n");

    let load = Arc::new(NamedLoad {
        calls: AtomicUsize::new(0),
    });
    let summary = runner(load)
        .run(input.path(), output.path(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!((summary.total, summary.succeeded, summary.failed), (2, 1, 1));
    assert_ne!(summary.runs[0].artifacts.dir, summary.runs[1].artifacts.dir);

    let kept = std::fs::read_to_string(output.path().join("b").join("result.json")).unwrap();
    let v: serde_json::Value = serde_json::from_str(&kept).unwrap();
    assert_eq!(v["status"], "success");

    let rejected = std::fs::read_to_string(output.path().join("b.rejected").join("result.json")).unwrap();
    let v: serde_json::Value = serde_json::from_str(&rejected).unwrap();
    assert_eq!(v["status"], "failure");
    assert_eq!(v["failure"]["kind"], "invalid");
}

#[tokio::test(start_paused = true)]
async fn test_summary_files_and_rerun() {
    let input = tempfile::TempDir::new().unwrap();
    let output = tempfile::TempDir::new().unwrap();
    three_descriptors(input.path());

    let load = Arc::new(NamedLoad {
        calls: AtomicUsize::new(0),
    });
    let runner = runner(load.clone());
    let first = runner
        .run(input.path(), output.path(), &CancellationToken::new())
        .await
        .unwrap();
    let second = runner
        .run(input.path(), output.path(), &CancellationToken::new())
        .await
        .unwrap();

    assert_ne!(first.batch_id, second.batch_id);
    assert_eq!(
        (second.total, second.succeeded, second.failed),
        (first.total, first.succeeded, first.failed)
    );

    let json = std::fs::read_to_string(output.path().join(SUMMARY_JSON)).unwrap();
    let v: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(v["batch_id"], second.batch_id.as_str());
    assert_eq!(v["total"], 3);
    assert_eq!(v["runs"].as_array().unwrap().len(), 3);

    let csv = std::fs::read_to_string(output.path().join(SUMMARY_CSV)).unwrap();
    assert_eq!(csv.lines().count(), 4);
    assert!(csv.lines().nth(2).unwrap().starts_with("fail-second,failure"));
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_batch_rejects_remaining_runs() {
    let input = tempfile::TempDir::new().unwrap();
    let output = tempfile::TempDir::new().unwrap();
    three_descriptors(input.path());

    let load = Arc::new(NamedLoad {
        calls: AtomicUsize::new(0),
    });
    let cancel = CancellationToken::new();
    cancel.cancel();

    let summary = tokio_test::assert_ok!(runner(load.clone()).run(input.path(), output.path(), &cancel).await);

    assert_eq!(load.calls.load(Ordering::SeqCst), 0);
    assert_eq!(summary.failed, 3);
    assert!(summary
        .runs
        .iter()
        .all(|r| r.failure.as_deref().unwrap_or("").contains("cancelled")));
}
