//! Interface counter sampler.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{MonitorError, Poller};
use crate::system::counters::{CounterSource, InterfaceCounters};

/// One reading of the cumulative counters.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CounterSample {
    pub timestamp: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub counters: InterfaceCounters,
}

/// Appends one [`CounterSample`] per tick for a single interface. Values are
/// recorded as read; decreasing counters are kept, not corrected.
pub struct CounterSampler {
    source: Arc<dyn CounterSource>,
    interface: String,
    samples: Vec<CounterSample>,
}

impl CounterSampler {
    pub fn new(source: Arc<dyn CounterSource>, interface: impl Into<String>) -> Self {
        Self {
            source,
            interface: interface.into(),
            samples: Vec::new(),
        }
    }
}

#[async_trait::async_trait]
impl Poller for CounterSampler {
    type Record = CounterSample;
    const NAME: &'static str = "counter sampler";

    async fn poll(&mut self, now: DateTime<Utc>, elapsed: Duration) -> Result<(), MonitorError> {
        let counters = self.source.read(&self.interface).await?;
        self.samples.push(CounterSample {
            timestamp: now,
            elapsed_ms: elapsed.as_millis() as u64,
            counters,
        });
        Ok(())
    }

    fn finish(self, _now: DateTime<Utc>) -> Vec<CounterSample> {
        self.samples
    }
}
