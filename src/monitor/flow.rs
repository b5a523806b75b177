//! Connection lifecycle tracking.
//!
//! Lifecycles are inferred by diffing consecutive snapshots of the
//! connection table. A connection that closes and reopens with the same
//! identity between two snapshots is indistinguishable from one that stayed
//! open; resolution is bounded by the tracker's period.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use super::{MonitorError, Poller};
use crate::system::connections::{ConnectionSource, FlowKey};

/// One observed connection lifecycle.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FlowRecord {
    pub key: FlowKey,
    pub start: DateTime<Utc>,
    /// `None` when the flow was still open at stop.
    pub end: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    /// Still open when tracking stopped.
    pub truncated: bool,
    /// Already present in the first snapshot, so `start` is an upper bound.
    pub preexisting: bool,
}

#[derive(Debug, Clone, Copy)]
struct OpenFlow {
    start: DateTime<Utc>,
    preexisting: bool,
}

/// Per-tick change counts returned by [`FlowTable::observe`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickDelta {
    pub opened: usize,
    pub closed: usize,
}

/// Set-difference state machine over connection snapshots.
#[derive(Debug, Default)]
pub struct FlowTable {
    open: HashMap<FlowKey, OpenFlow>,
    closed: Vec<FlowRecord>,
    snapshots: u64,
}

impl FlowTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply the snapshot taken at `now`: keys no longer present are closed
    /// with end `now`, new keys are opened with start `now`.
    pub fn observe(&mut self, current: HashSet<FlowKey>, now: DateTime<Utc>) -> TickDelta {
        let first = self.snapshots == 0;
        self.snapshots += 1;

        let mut vanished: Vec<FlowKey> = self
            .open
            .keys()
            .filter(|k| !current.contains(*k))
            .cloned()
            .collect();
        vanished.sort();

        let closed = vanished.len();
        for key in vanished {
            if let Some(flow) = self.open.remove(&key) {
                let end = now.max(flow.start);
                self.closed.push(FlowRecord {
                    duration_secs: Some(secs_between(flow.start, end)),
                    key,
                    start: flow.start,
                    end: Some(end),
                    truncated: false,
                    preexisting: flow.preexisting,
                });
            }
        }

        let mut opened = 0;
        for key in current {
            self.open.entry(key).or_insert_with(|| {
                opened += 1;
                OpenFlow {
                    start: now,
                    preexisting: first,
                }
            });
        }

        TickDelta { opened, closed }
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    pub fn closed_count(&self) -> usize {
        self.closed.len()
    }

    /// Consume the table: closed flows in close order, then every flow still
    /// open as a truncated record ordered by start.
    pub fn finish(self) -> Vec<FlowRecord> {
        let mut records = self.closed;
        let mut still_open: Vec<(FlowKey, OpenFlow)> = self.open.into_iter().collect();
        still_open.sort_by(|a, b| a.1.start.cmp(&b.1.start).then_with(|| a.0.cmp(&b.0)));

        records.extend(still_open.into_iter().map(|(key, flow)| FlowRecord {
            key,
            start: flow.start,
            end: None,
            duration_secs: None,
            truncated: true,
            preexisting: flow.preexisting,
        }));
        records
    }
}

fn secs_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_milliseconds() as f64 / 1000.0
}

/// Polls the connection table and feeds a [`FlowTable`].
///
/// A failed snapshot leaves the table untouched, so a transient read error
/// never fabricates closes.
pub struct FlowTracker {
    source: Arc<dyn ConnectionSource>,
    ports: Vec<u16>,
    table: FlowTable,
}

impl FlowTracker {
    pub fn new(source: Arc<dyn ConnectionSource>) -> Self {
        Self {
            source,
            ports: Vec::new(),
            table: FlowTable::new(),
        }
    }

    /// Only track connections with either side on one of `ports`. Empty
    /// means track everything.
    pub fn with_port_filter(mut self, ports: Vec<u16>) -> Self {
        self.ports = ports;
        self
    }
}

#[async_trait::async_trait]
impl Poller for FlowTracker {
    type Record = FlowRecord;
    const NAME: &'static str = "flow tracker";

    async fn poll(&mut self, now: DateTime<Utc>, _elapsed: Duration) -> Result<(), MonitorError> {
        let mut snapshot = self.source.snapshot().await?;
        if !self.ports.is_empty() {
            snapshot.retain(|k| k.touches_any(&self.ports));
        }

        let delta = self.table.observe(snapshot, now);
        if delta.opened > 0 || delta.closed > 0 {
            debug!(
                opened = delta.opened,
                closed = delta.closed,
                open = self.table.open_count(),
                "flow table changed"
            );
        }
        Ok(())
    }

    fn finish(self, _now: DateTime<Utc>) -> Vec<FlowRecord> {
        self.table.finish()
    }
}
