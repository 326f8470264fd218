//! Elapsed-time and throughput tracking.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Window over which the instantaneous speed is computed.
pub const SPEED_WINDOW: Duration = Duration::from_secs(1);

/// Monotonic stopwatch.
#[derive(Debug, Clone, Copy)]
pub struct ElapsedTime {
    start: Instant,
}

impl Default for ElapsedTime {
    fn default() -> Self {
        Self::new()
    }
}

impl ElapsedTime {
    /// Start measuring now.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Time since start or the last reset.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Restart the stopwatch, returning the time that had elapsed.
    pub fn reset(&mut self) -> Duration {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.start);
        self.start = now;
        elapsed
    }
}

/// Accumulates byte counts and reports average and recent throughput in
/// bytes per second.
#[derive(Debug, Clone)]
pub struct Speed {
    clock: ElapsedTime,
    total: u64,
    window: VecDeque<(Instant, u64)>,
}

impl Default for Speed {
    fn default() -> Self {
        Self::new()
    }
}

impl Speed {
    /// Create a tracker starting now with a zero total.
    pub fn new() -> Self {
        Self {
            clock: ElapsedTime::new(),
            total: 0,
            window: VecDeque::new(),
        }
    }

    /// Record `value` bytes.
    pub fn add(&mut self, value: u64) {
        let now = Instant::now();
        self.total = self.total.saturating_add(value);
        self.window.push_back((now, value));
        self.trim(now);
    }

    /// Total bytes since the last reset.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Time since the last reset.
    pub fn elapsed(&self) -> Duration {
        self.clock.elapsed()
    }

    /// Average throughput since the last reset.
    pub fn avg_speed(&self) -> f64 {
        let secs = self.clock.elapsed().as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.total as f64 / secs
    }

    /// Throughput over the most recent [`SPEED_WINDOW`].
    pub fn speed(&self) -> f64 {
        let cutoff = Instant::now().checked_sub(SPEED_WINDOW);
        let recent: u64 = self
            .window
            .iter()
            .filter(|(at, _)| cutoff.map_or(true, |c| *at >= c))
            .map(|(_, v)| *v)
            .sum();
        let span = self.clock.elapsed().min(SPEED_WINDOW).as_secs_f64();
        if span <= 0.0 {
            return 0.0;
        }
        recent as f64 / span
    }

    /// Zero the total and restart the clock.
    pub fn reset(&mut self) {
        self.clock.reset();
        self.total = 0;
        self.window.clear();
    }

    fn trim(&mut self, now: Instant) {
        while let Some((at, _)) = self.window.front() {
            if now.saturating_duration_since(*at) > SPEED_WINDOW {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }
}
