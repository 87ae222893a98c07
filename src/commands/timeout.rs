use std::time::{Duration, Instant};

/// Timeout policy for a single management-tool invocation
#[derive(Debug, Clone)]
pub struct TimeoutStrategy {
    /// Hard limit in seconds; the process is killed once it is reached
    pub timeout_secs: u64,

    /// Fraction of the limit after which a slow command is reported
    pub warning_multiplier: f64,
}

const DEFAULT_WARNING_MULTIPLIER: f64 = 0.8;

impl Default for TimeoutStrategy {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            warning_multiplier: DEFAULT_WARNING_MULTIPLIER,
        }
    }
}

impl TimeoutStrategy {
    pub fn with_timeout(timeout_secs: u64) -> Self {
        Self {
            timeout_secs,
            ..Default::default()
        }
    }

    /// Get warning threshold
    pub fn warning_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs as f64 * self.warning_multiplier)
    }

    /// Get kill threshold
    pub fn kill_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Current phase of a running command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    /// Within the expected duration
    Normal,
    /// Past the warning threshold, still allowed to finish
    Warning,
    /// Past the limit, must be terminated
    ForceKill,
}

/// Tracks timeout state for a running command
#[derive(Debug)]
pub struct TimeoutTracker {
    strategy: TimeoutStrategy,
    start_time: Instant,
}

impl TimeoutTracker {
    pub fn new(strategy: TimeoutStrategy) -> Self {
        Self {
            strategy,
            start_time: Instant::now(),
        }
    }

    /// Get current phase based on elapsed time
    pub fn current_phase(&self) -> TimeoutPhase {
        let elapsed = self.start_time.elapsed();

        if elapsed >= self.strategy.kill_timeout() {
            TimeoutPhase::ForceKill
        } else if elapsed >= self.strategy.warning_timeout() {
            TimeoutPhase::Warning
        } else {
            TimeoutPhase::Normal
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Time remaining until the next phase boundary, `None` once killing is due
    pub fn time_to_next_phase(&self) -> Option<Duration> {
        let elapsed = self.start_time.elapsed();
        let boundary = match self.current_phase() {
            TimeoutPhase::Normal => self.strategy.warning_timeout(),
            TimeoutPhase::Warning => self.strategy.kill_timeout(),
            TimeoutPhase::ForceKill => return None,
        };
        Some(boundary.saturating_sub(elapsed))
    }
}
