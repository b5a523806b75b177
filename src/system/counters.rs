//! Interface counter collaborator.
//!
//! Reads cumulative per-interface statistics from the kernel's
//! `/proc/net/dev` table. The table is re-read on every query; nothing is
//! cached between calls.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::monitor::MonitorError;

/// Cumulative counters for one interface at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceCounters {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
    pub errin: u64,
    pub errout: u64,
    pub dropin: u64,
    pub dropout: u64,
}

/// Source of cumulative interface counters.
#[async_trait::async_trait]
pub trait CounterSource: Send + Sync {
    /// Return the counters for `interface` as of now.
    async fn read(&self, interface: &str) -> Result<InterfaceCounters, MonitorError>;
}

/// Linux `/proc/net/dev` reader.
pub struct ProcNetDev {
    path: PathBuf,
}

impl Default for ProcNetDev {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/proc/net/dev"),
        }
    }
}

impl ProcNetDev {
    /// Read from an alternate file with the same layout.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl CounterSource for ProcNetDev {
    async fn read(&self, interface: &str) -> Result<InterfaceCounters, MonitorError> {
        let table = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| MonitorError::Read(format!("{}: {}", self.path.display(), e)))?;
        parse_proc_net_dev(&table, interface)
    }
}

/// Extract one interface's counters from `/proc/net/dev` text.
///
/// Layout after the two header lines:
/// `  name: rx_bytes rx_packets rx_errs rx_drop fifo frame compressed multicast
///          tx_bytes tx_packets tx_errs tx_drop fifo colls carrier compressed`
pub fn parse_proc_net_dev(table: &str, interface: &str) -> Result<InterfaceCounters, MonitorError> {
    let mut available = Vec::new();

    for line in table.lines().skip(2) {
        let Some((name, rest)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if name != interface {
            available.push(name.to_string());
            continue;
        }

        let fields: Vec<u64> = rest
            .split_whitespace()
            .map(|f| f.parse::<u64>())
            .collect::<Result<_, _>>()
            .map_err(|e| MonitorError::Parse(format!("counter row for {}: {}", interface, e)))?;
        if fields.len() < 12 {
            return Err(MonitorError::Parse(format!(
                "counter row for {} has {} fields, expected 16",
                interface,
                fields.len()
            )));
        }

        return Ok(InterfaceCounters {
            bytes_recv: fields[0],
            packets_recv: fields[1],
            errin: fields[2],
            dropin: fields[3],
            bytes_sent: fields[8],
            packets_sent: fields[9],
            errout: fields[10],
            dropout: fields[11],
        });
    }

    Err(MonitorError::InterfaceNotFound {
        interface: interface.to_string(),
        available,
    })
}
