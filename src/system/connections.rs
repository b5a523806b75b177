//! Connection snapshot collaborator.
//!
//! Each query shells out to `ss -Htn` and returns the set of TCP connection
//! identities visible at that instant.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::monitor::MonitorError;

/// Transport protocol of a tracked connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
        }
    }
}

/// One side of a connection. The address is kept as printed by the OS so
/// scoped IPv6 addresses (`fe80::1%eth0`) survive unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub addr: String,
    pub port: u16,
}

impl Endpoint {
    /// Parse `addr:port`, `[v6addr]:port` or `v6addr:port` as printed by `ss`.
    pub fn parse(s: &str) -> Option<Self> {
        let (addr, port) = s.rsplit_once(':')?;
        let port = port.parse::<u16>().ok()?;
        let addr = addr.trim_start_matches('[').trim_end_matches(']');
        if addr.is_empty() {
            return None;
        }
        Some(Self {
            addr: addr.to_string(),
            port,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.addr.contains(':') {
            write!(f, "[{}]:{}", self.addr, self.port)
        } else {
            write!(f, "{}:{}", self.addr, self.port)
        }
    }
}

/// Identity of a connection. Two snapshots refer to the same flow only if
/// every field matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowKey {
    pub protocol: Protocol,
    pub local: Endpoint,
    pub remote: Endpoint,
}

impl FlowKey {
    pub fn tcp(local: Endpoint, remote: Endpoint) -> Self {
        Self {
            protocol: Protocol::Tcp,
            local,
            remote,
        }
    }

    /// True if either side uses one of `ports`.
    pub fn touches_any(&self, ports: &[u16]) -> bool {
        ports.contains(&self.local.port) || ports.contains(&self.remote.port)
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.protocol, self.local, self.remote)
    }
}

/// Source of active connection identities.
#[async_trait::async_trait]
pub trait ConnectionSource: Send + Sync {
    async fn snapshot(&self) -> Result<HashSet<FlowKey>, MonitorError>;
}

/// `ss`-backed connection table reader.
pub struct SsCommand {
    program: String,
}

impl Default for SsCommand {
    fn default() -> Self {
        Self {
            program: "ss".to_string(),
        }
    }
}

#[async_trait::async_trait]
impl ConnectionSource for SsCommand {
    async fn snapshot(&self) -> Result<HashSet<FlowKey>, MonitorError> {
        let output = tokio::process::Command::new(&self.program)
            .arg("-H")
            .arg("-t")
            .arg("-n")
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| MonitorError::Read(format!("failed to execute {}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MonitorError::Read(format!(
                "{} exited with {:?}: {}",
                self.program,
                output.status.code(),
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_ss_output(&stdout))
    }
}

/// Parse `ss -tn` output into connection identities.
///
/// Column layout: `State Recv-Q Send-Q Local:Port Peer:Port [Process]`. A
/// header row, if present, is skipped because its address columns do not
/// parse. Unparseable rows are dropped.
pub fn parse_ss_output(output: &str) -> HashSet<FlowKey> {
    let mut flows = HashSet::new();
    for line in output.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 5 {
            continue;
        }
        match (Endpoint::parse(tokens[3]), Endpoint::parse(tokens[4])) {
            (Some(local), Some(remote)) => {
                flows.insert(FlowKey::tcp(local, remote));
            }
            _ => trace!(line, "skipping unparseable ss row"),
        }
    }
    flows
}
