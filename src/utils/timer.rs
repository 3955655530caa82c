//! Latency samples of blocking synchronization calls.

use quanta::Instant;
use std::time::Duration;

#[derive(Clone)]
pub struct TimerStats {
    /// CDF of latencies.
    pub cdf: [Duration; 100],
    pub avg: Duration,
    pub total: usize,
}

impl std::fmt::Debug for TimerStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("total", &self.total)
            .field("lat-p50", &self.median())
            .field("lat-p99", &self.p99())
            .finish()
    }
}

impl TimerStats {
    pub fn median(&self) -> Duration {
        self.cdf[50]
    }

    pub fn p99(&self) -> Duration {
        self.cdf[99]
    }
}

/// Collection of latency samples.
#[derive(Debug, Default)]
pub struct Timer {
    latencies: Vec<Duration>,
}

impl Timer {
    pub const fn new() -> Self {
        Self {
            latencies: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.latencies.is_empty()
    }

    pub fn len(&self) -> usize {
        self.latencies.len()
    }

    pub fn push(&mut self, latency: Duration) {
        self.latencies.push(latency);
    }

    /// Move `other`'s samples into this timer, leaving `other` empty.
    pub fn merge_mut(&mut self, other: &mut Timer) {
        self.latencies.append(&mut other.latencies);
    }

    pub fn report(&mut self) -> TimerStats {
        let total = self.latencies.len();
        if total == 0 {
            return TimerStats {
                cdf: [Duration::ZERO; 100],
                avg: Duration::ZERO,
                total: 0,
            };
        }
        self.latencies.sort_unstable();

        let avg = self.latencies.iter().sum::<Duration>() / total as u32;
        let mut cdf = [Duration::ZERO; 100];
        for (i, lat) in cdf.iter_mut().enumerate().skip(1) {
            *lat = self.latencies[(total * i) / 100];
        }
        TimerStats { cdf, avg, total }
    }
}

/// Guard that records its own lifetime into a timer on drop.
pub struct TimerOp<'a> {
    timer: &'a mut Timer,
    start: Instant,
}

impl<'a> TimerOp<'a> {
    pub fn new(timer: &'a mut Timer) -> Self {
        Self {
            timer,
            start: Instant::now(),
        }
    }
}

impl Drop for TimerOp<'_> {
    fn drop(&mut self) {
        self.timer.push(self.start.elapsed());
    }
}
