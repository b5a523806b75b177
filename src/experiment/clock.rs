//! Run-relative clock.
//!
//! Wall-clock timestamps are derived from a single wall reading at run start
//! plus monotonic elapsed time, so every timestamp taken during a run is
//! non-decreasing even if the system clock steps.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct RunClock {
    wall_start: DateTime<Utc>,
    mono_start: Instant,
}

impl RunClock {
    pub fn start() -> Self {
        Self {
            wall_start: Utc::now(),
            mono_start: Instant::now(),
        }
    }

    /// Wall-clock time of [`RunClock::start`].
    pub fn started_at(&self) -> DateTime<Utc> {
        self.wall_start
    }

    pub fn elapsed(&self) -> Duration {
        self.mono_start.elapsed()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.at(self.elapsed())
    }

    /// Wall-clock time `offset` after run start.
    pub fn at(&self, offset: Duration) -> DateTime<Utc> {
        match chrono::Duration::from_std(offset) {
            Ok(delta) => self.wall_start + delta,
            Err(_) => self.wall_start,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_now_follows_monotonic_elapsed() {
        let clock = RunClock::start();
        let t0 = clock.now();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let t1 = clock.now();

        assert_eq!((t1 - t0).num_milliseconds(), 1500);
        assert_eq!(clock.elapsed(), Duration::from_millis(1500));
    }

    #[test]
    fn test_at_offsets_from_start() {
        let clock = RunClock::start();
        let later = clock.at(Duration::from_secs(3));
        assert_eq!((later - clock.started_at()).num_seconds(), 3);
    }
}
