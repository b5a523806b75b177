//! Load summary formatting.

use super::LoadSummary;

fn format_rate(bps: f64) -> String {
    let mbps = bps / 1_000_000.0;
    if mbps >= 1000.0 {
        format!("{:.2} Gbps", mbps / 1000.0)
    } else {
        format!("{:.1} Mbps", mbps)
    }
}

/// Format a load summary as a human-readable line.
pub fn format_summary(summary: &LoadSummary) -> String {
    let mut line = format!(
        "{} {} ({} stream{}, {:.1}s, sent {} / received {})",
        summary.protocol,
        format_rate(summary.received_bps),
        summary.streams,
        if summary.streams == 1 { "" } else { "s" },
        summary.duration_secs,
        format_bytes(summary.bytes_sent),
        format_bytes(summary.bytes_received),
    );

    if let Some(retr) = summary.retransmits {
        line.push_str(&format!(", retransmits: {}", retr));
    }
    if let Some(jitter) = summary.jitter_ms {
        line.push_str(&format!(", jitter: {:.2}ms", jitter));
    }
    if let Some(loss) = summary.lost_percent {
        line.push_str(&format!(", loss: {:.2}%", loss));
    }

    line
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
