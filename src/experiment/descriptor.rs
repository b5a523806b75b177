//! Run descriptors.
//!
//! A [`RawDescriptor`] is what a descriptor file, CSV row or CLI invocation
//! provides; every field is optional. [`RawDescriptor::validate`] turns it
//! into an immutable [`RunDescriptor`] or a [`DescriptorError`] naming the
//! offending field.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_SERVER: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 5201;
pub const MAX_PARALLEL: u32 = 128;

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("failed to read descriptor {}: {reason}", .path.display())]
    Read { path: PathBuf, reason: String },

    #[error("failed to parse descriptor {}: {reason}", .path.display())]
    Parse { path: PathBuf, reason: String },

    #[error("unsupported descriptor format: {}", .0.display())]
    UnsupportedFormat(PathBuf),

    #[error("missing required field '{0}'")]
    Missing(&'static str),

    #[error("invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Which side of the load generator this endpoint runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Client,
    Server,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Client => write!(f, "client"),
            Role::Server => write!(f, "server"),
        }
    }
}

/// Unvalidated descriptor as read from a file, CSV row or the command line.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawDescriptor {
    pub name: Option<String>,
    pub duration_secs: Option<u64>,
    pub parallel: Option<u32>,
    pub interface: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub transfer_size: Option<String>,
    pub bitrate: Option<String>,
    pub role: Option<Role>,
    pub server: Option<String>,
    pub port: Option<u16>,
    pub reverse: Option<bool>,
}

/// One validated experiment. Immutable once a run starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunDescriptor {
    pub name: String,
    #[serde(rename = "duration_secs", serialize_with = "ser_secs")]
    pub duration: Duration,
    pub parallel: u32,
    pub interface: String,
    pub output_dir: PathBuf,
    pub transfer_size: Option<String>,
    pub bitrate: Option<String>,
    pub role: Role,
    pub server: String,
    pub port: u16,
    pub reverse: bool,
}

fn ser_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_secs())
}

impl RawDescriptor {
    /// Read a single-experiment TOML or JSON file, chosen by extension.
    pub fn from_file(path: &Path) -> Result<Self, DescriptorError> {
        let text = std::fs::read_to_string(path).map_err(|e| DescriptorError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let parse_err = |reason: String| DescriptorError::Parse {
            path: path.to_path_buf(),
            reason,
        };

        match extension(path).as_deref() {
            Some("toml") => toml::from_str(&text).map_err(|e| parse_err(e.to_string())),
            Some("json") => serde_json::from_str(&text).map_err(|e| parse_err(e.to_string())),
            _ => Err(DescriptorError::UnsupportedFormat(path.to_path_buf())),
        }
    }

    /// Read a CSV experiment list, one descriptor per row. A malformed row
    /// yields an error in its slot without affecting the others.
    pub fn from_csv(path: &Path) -> Result<Vec<Result<Self, DescriptorError>>, DescriptorError> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(|e| DescriptorError::Read {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        Ok(reader
            .deserialize::<RawDescriptor>()
            .map(|row| {
                row.map_err(|e| DescriptorError::Parse {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })
            })
            .collect())
    }

    /// Validate into a [`RunDescriptor`]. `fallback_name` is used when the
    /// descriptor has no name; the output directory defaults to
    /// `output_root/<name>`.
    pub fn validate(self, fallback_name: &str, output_root: &Path) -> Result<RunDescriptor, DescriptorError> {
        let name = self
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| fallback_name.to_string());
        validate_name(&name)?;

        let duration_secs = self.duration_secs.ok_or(DescriptorError::Missing("duration_secs"))?;
        if duration_secs == 0 {
            return Err(DescriptorError::Invalid {
                field: "duration_secs",
                reason: "must be greater than zero".to_string(),
            });
        }

        let parallel = self.parallel.unwrap_or(1);
        if parallel == 0 || parallel > MAX_PARALLEL {
            return Err(DescriptorError::Invalid {
                field: "parallel",
                reason: format!("{} is outside 1..={}", parallel, MAX_PARALLEL),
            });
        }

        let interface = self
            .interface
            .filter(|i| !i.trim().is_empty())
            .ok_or(DescriptorError::Missing("interface"))?;
        if interface.starts_with('-') || interface.contains(&['/', ' ', ':'][..]) {
            return Err(DescriptorError::Invalid {
                field: "interface",
                reason: format!("'{}' is not an interface name", interface),
            });
        }

        if let Some(size) = &self.transfer_size {
            validate_size("transfer_size", size)?;
        }
        if let Some(rate) = &self.bitrate {
            validate_size("bitrate", rate)?;
        }

        let server = self.server.unwrap_or_else(|| DEFAULT_SERVER.to_string());
        validate_target(&server)?;

        let port = self.port.unwrap_or(DEFAULT_PORT);
        if port == 0 {
            return Err(DescriptorError::Invalid {
                field: "port",
                reason: "must be non-zero".to_string(),
            });
        }

        let output_dir = self.output_dir.unwrap_or_else(|| output_root.join(&name));

        Ok(RunDescriptor {
            name,
            duration: Duration::from_secs(duration_secs),
            parallel,
            interface,
            output_dir,
            transfer_size: self.transfer_size,
            bitrate: self.bitrate,
            role: self.role.unwrap_or_default(),
            server,
            port,
            reverse: self.reverse.unwrap_or(false),
        })
    }
}

pub(crate) fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

fn validate_name(name: &str) -> Result<(), DescriptorError> {
    let ok = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if ok {
        Ok(())
    } else {
        Err(DescriptorError::Invalid {
            field: "name",
            reason: format!("'{}' must be a plain directory name", name),
        })
    }
}

/// Host names end up on the load generator's command line.
fn validate_target(target: &str) -> Result<(), DescriptorError> {
    let invalid = |reason: &str| DescriptorError::Invalid {
        field: "server",
        reason: reason.to_string(),
    };
    if target.is_empty() {
        return Err(invalid("cannot be empty"));
    }
    if target.starts_with('-') {
        return Err(invalid("cannot start with hyphen"));
    }
    // alphanumeric, dot, hyphen, colon (IPv6)
    if target
        .chars()
        .any(|c| !c.is_alphanumeric() && c != '.' && c != '-' && c != ':')
    {
        return Err(invalid("contains invalid characters"));
    }
    Ok(())
}

/// iperf3 size/rate syntax: a number with an optional K/M/G/T suffix.
fn validate_size(field: &'static str, value: &str) -> Result<(), DescriptorError> {
    let digits = value.trim_end_matches(&['k', 'K', 'm', 'M', 'g', 'G', 't', 'T'][..]);
    let suffix_len = value.len() - digits.len();
    let ok = suffix_len <= 1
        && !digits.is_empty()
        && digits.parse::<f64>().map(|v| v > 0.0 && v.is_finite()).unwrap_or(false);
    if ok {
        Ok(())
    } else {
        Err(DescriptorError::Invalid {
            field,
            reason: format!("'{}' is not a size like 100M or 2G", value),
        })
    }
}
