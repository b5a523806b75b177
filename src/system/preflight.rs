//! Startup checks for the external collaborators.
//!
//! A missing load generator or connection table reader is the one
//! configuration error that stops the process before any run starts.

use std::path::Path;
use std::process::Command;

use serde::Serialize;
use tracing::info;

use crate::config::{LoadConfig, NetexpConfig};
use crate::system::counters::parse_proc_net_dev;

/// Outcome of one collaborator check.
#[derive(Debug, Serialize, Clone)]
pub struct ComponentResult {
    pub component: String,
    pub status: CheckStatus,
    pub details: String,
    pub remediation: Option<String>,
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Fail,
    Warning,
    Skipped,
}

impl CheckStatus {
    pub fn label(&self) -> &'static str {
        match self {
            CheckStatus::Pass => "PASS",
            CheckStatus::Fail => "FAIL",
            CheckStatus::Warning => "WARN",
            CheckStatus::Skipped => "SKIP",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PreflightReport {
    pub results: Vec<ComponentResult>,
}

impl PreflightReport {
    /// True when no check failed outright.
    pub fn is_ready(&self) -> bool {
        self.results.iter().all(|r| r.status != CheckStatus::Fail)
    }

    /// Names of the failed components, for error messages.
    pub fn failures(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|r| r.status == CheckStatus::Fail)
            .map(|r| format!("{}: {}", r.component, r.details))
            .collect()
    }
}

/// Run every collaborator check. `interfaces` are verified against the
/// counter table when given; monitor-only captures skip the load generator.
pub fn run(cfg: &NetexpConfig, interfaces: &[String], needs_load: bool) -> PreflightReport {
    info!("Preflight: checking collaborators...");

    let mut results = if needs_load {
        check_load(&cfg.load)
    } else {
        vec![ComponentResult {
            component: "Load generator".to_string(),
            status: CheckStatus::Skipped,
            details: "not needed for monitor-only capture".to_string(),
            remediation: None,
        }]
    };
    results.push(check_binary(
        "Connection table",
        "ss",
        "-V",
        "Install iproute2 to provide 'ss'.",
    ));
    results.extend(check_counter_table(Path::new("/proc/net/dev"), interfaces));

    info!("Preflight complete. {} check(s) run.", results.len());
    PreflightReport { results }
}

/// The load binary, plus the wrapper it is launched through when one is set.
fn check_load(cfg: &LoadConfig) -> Vec<ComponentResult> {
    let mut results = vec![check_binary(
        "Load generator",
        &cfg.iperf3_path,
        "--version",
        "Install iperf3 (e.g. 'sudo apt install iperf3') or set load.iperf3_path.",
    )];
    if let Some(wrapper) = cfg.command_prefix.first() {
        results.push(check_binary(
            "Load wrapper",
            wrapper,
            "--version",
            "Install the wrapper or fix load.command_prefix.",
        ));
    }
    results
}

fn check_binary(component: &str, program: &str, version_flag: &str, hint: &str) -> ComponentResult {
    match Command::new(program).arg(version_flag).output() {
        Ok(out) => {
            let text = String::from_utf8_lossy(&out.stdout);
            let first = text.lines().next().unwrap_or("").trim().to_string();
            ComponentResult {
                component: component.to_string(),
                status: if out.status.success() {
                    CheckStatus::Pass
                } else {
                    CheckStatus::Warning
                },
                details: if first.is_empty() {
                    format!("{} responded with {:?}", program, out.status.code())
                } else {
                    first
                },
                remediation: None,
            }
        }
        Err(e) => ComponentResult {
            component: component.to_string(),
            status: CheckStatus::Fail,
            details: format!("'{}' could not be executed: {}", program, e),
            remediation: Some(hint.to_string()),
        },
    }
}

fn check_counter_table(path: &Path, interfaces: &[String]) -> Vec<ComponentResult> {
    let table = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) => {
            return vec![ComponentResult {
                component: "Interface counters".to_string(),
                status: CheckStatus::Fail,
                details: format!("Failed to read {}: {}", path.display(), e),
                remediation: Some("Interface counters are read from procfs (Linux only).".to_string()),
            }]
        }
    };

    let mut results = vec![ComponentResult {
        component: "Interface counters".to_string(),
        status: CheckStatus::Pass,
        details: format!("{} readable", path.display()),
        remediation: None,
    }];

    for iface in interfaces {
        let result = match parse_proc_net_dev(&table, iface) {
            Ok(c) => ComponentResult {
                component: format!("Interface: {}", iface),
                status: CheckStatus::Pass,
                details: format!("rx {} bytes, tx {} bytes", c.bytes_recv, c.bytes_sent),
                remediation: None,
            },
            Err(e) => ComponentResult {
                component: format!("Interface: {}", iface),
                status: CheckStatus::Fail,
                details: e.to_string(),
                remediation: Some("Check the interface name in the run descriptor.".to_string()),
            },
        };
        results.push(result);
    }
    results
}
