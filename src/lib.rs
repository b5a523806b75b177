//! netexp -- network experiment orchestration.
//!
//! Drives an iperf3 load generator while sampling interface counters and
//! TCP connection lifecycles, writes time-aligned per-run artifacts, and
//! runs batches of experiments sequentially with per-run failure accounting.

pub mod batch;
pub mod config;
pub mod experiment;
pub mod monitor;
pub mod storage;
pub mod system;
pub mod throughput;

use tokio_util::sync::CancellationToken;

/// Token cancelled on the first SIGINT or SIGTERM.
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => tracing::info!("received SIGINT, stopping"),
                        _ = sigterm.recv() => tracing::info!("received SIGTERM, stopping"),
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to register SIGTERM handler");
                    let _ = ctrl_c.await;
                    tracing::info!("received SIGINT, stopping");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            tracing::info!("received SIGINT, stopping");
        }

        trigger.cancel();
    });

    token
}
