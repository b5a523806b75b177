//! TOML configuration for netexp.
//!
//! Layered model: an explicit `--config` path, then the `NETEXP_CONFIG`
//! environment variable, then `/etc/netexp/netexp.toml`, then compiled-in
//! defaults. Every section is optional so partial files work.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Environment variable naming an alternate configuration file.
pub const CONFIG_ENV: &str = "NETEXP_CONFIG";

const SYSTEM_CONFIG_PATH: &str = "/etc/netexp/netexp.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration, constructed once per process and shared read-only by
/// every run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetexpConfig {
    #[serde(default)]
    pub sampling: SamplingConfig,
    #[serde(default)]
    pub load: LoadConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetexpConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded netexp configuration");
        Ok(config)
    }

    /// Resolve the configuration for this process.
    ///
    /// An explicit path must load; the environment and system locations fall
    /// back to defaults with a warning.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "NETEXP_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }

    /// Reject values that would make a run meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.sampling.counter_period_ms == 0 {
            anyhow::bail!("sampling.counter_period_ms must be > 0");
        }
        if self.sampling.flow_period_ms == 0 {
            anyhow::bail!("sampling.flow_period_ms must be > 0");
        }
        if self.sampling.unhealthy_after == 0 {
            anyhow::bail!("sampling.unhealthy_after must be > 0");
        }
        if self.load.iperf3_path.trim().is_empty() {
            anyhow::bail!("load.iperf3_path must not be empty");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sampling
// ---------------------------------------------------------------------------

/// Cadence and health policy for the two sampling loops.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Interface counter sampling period (milliseconds).
    pub counter_period_ms: u64,
    /// Connection snapshot period (milliseconds).
    pub flow_period_ms: u64,
    /// Consecutive failed reads before a sampler reports itself unhealthy.
    pub unhealthy_after: u32,
    /// Maximum time to wait for both samplers to report ready.
    pub startup_timeout_ms: u64,
    /// When non-empty, only connections touching one of these ports are tracked.
    pub flow_ports: Vec<u16>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            counter_period_ms: 1000,
            flow_period_ms: 100,
            unhealthy_after: 3,
            startup_timeout_ms: 5000,
            flow_ports: Vec::new(),
        }
    }
}

impl SamplingConfig {
    pub fn counter_period(&self) -> Duration {
        Duration::from_millis(self.counter_period_ms)
    }

    pub fn flow_period(&self) -> Duration {
        Duration::from_millis(self.flow_period_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Load generator
// ---------------------------------------------------------------------------

/// Configuration for the iperf3 subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    /// Path (or bare command name resolved via `$PATH`) to the iperf3 binary.
    pub iperf3_path: String,
    /// Added to the run duration to form the hard timeout (seconds).
    pub grace_sec: u64,
    /// How long to wait after SIGTERM before escalating to SIGKILL (seconds).
    pub terminate_wait_sec: u64,
    /// Wrapper the binary is launched through, e.g. `["taskset", "-c", "2,3"]`
    /// to keep the generator off the sampling cores.
    pub command_prefix: Vec<String>,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            iperf3_path: "iperf3".to_string(),
            grace_sec: 10,
            terminate_wait_sec: 5,
            command_prefix: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Run window
// ---------------------------------------------------------------------------

/// Sampling margins around the load-generator window. Both are additive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Idle baseline captured before the load starts (milliseconds).
    pub pre_margin_ms: u64,
    /// Tail captured after the load exits (milliseconds).
    pub post_margin_ms: u64,
}

impl RunConfig {
    pub fn pre_margin(&self) -> Duration {
        Duration::from_millis(self.pre_margin_ms)
    }

    pub fn post_margin(&self) -> Duration {
        Duration::from_millis(self.post_margin_ms)
    }
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Pause between consecutive runs so lingering connections drain (seconds).
    pub cooldown_sec: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { cooldown_sec: 3 }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Results datastore.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub enabled: bool,
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            db_path: PathBuf::from("netexp.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
