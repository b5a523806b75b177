use std::time::Duration;

use anyhow::{Context, Result};
use netexp::config::NetexpConfig;
use netexp::experiment::{Orchestrator, RawDescriptor, RunStatus};
use tokio_util::sync::CancellationToken;

// Live integration tests.
// These spawn a real iperf3 server on loopback and sample the real `lo`
// interface and connection table.
// Run with `cargo test --release -- --ignored` on a Linux host with iperf3 and ss.

#[tokio::test]
#[ignore]
async fn test_loopback_experiment_live() -> Result<()> {
    let port = 5299;
    let mut server = tokio::process::Command::new("iperf3")
        .args(["-s", "-1", "-p", &port.to_string()])
        .kill_on_drop(true)
        .spawn()
        .context("iperf3 server could not be started")?;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let out = tempfile::TempDir::new()?;
    let mut cfg = NetexpConfig::default();
    cfg.run.pre_margin_ms = 1_000;
    cfg.run.post_margin_ms = 1_000;

    let descriptor = RawDescriptor {
        name: Some("loopback".to_string()),
        duration_secs: Some(3),
        parallel: Some(2),
        interface: Some("lo".to_string()),
        server: Some("127.0.0.1".to_string()),
        port: Some(port),
        ..Default::default()
    }
    .validate("loopback", out.path())?;

    println!("Running 3s loopback experiment...");
    let result = Orchestrator::for_system(&cfg)
        .run(&descriptor, &CancellationToken::new())
        .await;
    let _ = server.wait().await;

    println!(" - Status: {}", result.status.as_str());
    if let Some(f) = &result.failure {
        println!(" - Failure: {}", f);
    }
    assert_eq!(result.status, RunStatus::Success);

    let load = result.load.as_ref().context("load summary missing")?;
    println!(" - Throughput: {:.1} Mbps", load.throughput_mbps());
    assert!(load.throughput_mbps() > 0.0);
    assert_eq!(load.streams, 2);

    // ~5s window at the default 1s period
    assert!(result.counters.records >= 4, "counter samples: {}", result.counters.records);
    assert!(result.flows.records >= 2, "flow records: {}", result.flows.records);

    for file in ["counters.csv", "flows.csv", "load.json", "result.json", "run.log"] {
        assert!(out.path().join("loopback").join(file).exists(), "{} missing", file);
    }
    Ok(())
}

#[tokio::test]
#[ignore]
async fn test_monitor_capture_live() -> Result<()> {
    let out = tempfile::TempDir::new()?;
    let cfg = NetexpConfig::default();

    let descriptor = RawDescriptor {
        name: Some("idle".to_string()),
        duration_secs: Some(2),
        interface: Some("lo".to_string()),
        ..Default::default()
    }
    .validate("idle", out.path())?;

    let result = Orchestrator::for_monitoring(&cfg)
        .run(&descriptor, &CancellationToken::new())
        .await;

    assert_eq!(result.status, RunStatus::Success);
    assert!(result.load.is_none());
    assert!(result.counters.records >= 2);
    Ok(())
}
