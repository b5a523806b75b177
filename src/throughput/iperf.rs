//! iperf3 JSON output model.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Parsed iperf3 JSON result (subset of fields we care about).
#[derive(Debug, Deserialize)]
pub struct Iperf3Result {
    pub start: Iperf3Start,
    pub end: Iperf3End,
}

#[derive(Debug, Deserialize)]
pub struct Iperf3Start {
    pub test_start: Iperf3TestStart,
}

#[derive(Debug, Deserialize)]
pub struct Iperf3TestStart {
    pub protocol: String,
    pub num_streams: u32,
    pub duration: f64,
    #[serde(default)]
    pub bytes: u64,
    #[serde(default)]
    pub reverse: u8,
}

/// TCP runs report `sum_sent`/`sum_received`; UDP runs report `sum`.
#[derive(Debug, Deserialize)]
pub struct Iperf3End {
    #[serde(default)]
    pub sum_sent: Option<Iperf3Sum>,
    #[serde(default)]
    pub sum_received: Option<Iperf3Sum>,
    #[serde(default)]
    pub sum: Option<Iperf3Sum>,
}

#[derive(Debug, Deserialize)]
pub struct Iperf3Sum {
    #[serde(default)]
    pub seconds: f64,
    pub bits_per_second: f64,
    pub bytes: u64,
    #[serde(default)]
    pub retransmits: Option<u64>,
    #[serde(default)]
    pub jitter_ms: Option<f64>,
    #[serde(default)]
    pub lost_percent: Option<f64>,
}

/// Captured load-generator summary for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadSummary {
    pub protocol: String,
    pub streams: u32,
    pub duration_secs: f64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub sent_bps: f64,
    pub received_bps: f64,
    pub retransmits: Option<u64>,
    pub jitter_ms: Option<f64>,
    pub lost_percent: Option<f64>,
}

impl LoadSummary {
    pub fn throughput_mbps(&self) -> f64 {
        self.received_bps / 1_000_000.0
    }
}

impl Iperf3Result {
    /// Reduce to a [`LoadSummary`]. Fails if the output carries no totals.
    pub fn summary(&self) -> Result<LoadSummary> {
        let (sent, received) = match (&self.end.sum_sent, &self.end.sum_received, &self.end.sum) {
            (Some(s), Some(r), _) => (s, r),
            (_, _, Some(sum)) => (sum, sum),
            _ => return Err(anyhow!("iperf3 output has no end-of-test totals")),
        };

        Ok(LoadSummary {
            protocol: self.start.test_start.protocol.clone(),
            streams: self.start.test_start.num_streams,
            duration_secs: received.seconds.max(sent.seconds),
            bytes_sent: sent.bytes,
            bytes_received: received.bytes,
            sent_bps: sent.bits_per_second,
            received_bps: received.bits_per_second,
            retransmits: sent.retransmits,
            jitter_ms: received.jitter_ms,
            lost_percent: received.lost_percent,
        })
    }
}

/// Parse an iperf3 JSON output string into a structured result.
pub fn parse_output(json_str: &str) -> Result<Iperf3Result> {
    let result: Iperf3Result = serde_json::from_str(json_str)?;
    Ok(result)
}

/// iperf3 in JSON mode reports fatal errors as `{"error": "..."}` on stdout.
pub fn error_message(json_str: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(json_str).ok()?;
    value.get("error")?.as_str().map(str::to_string)
}
