use std::time::Duration;
use tokio::time::Instant;

/// Length of one throughput window.
pub const THROUGHPUT_WINDOW: Duration = Duration::from_secs(1);

/// Rolling per-window event counter backing the displayed frames-per-second.
///
/// Events are counted into the current window; once a window has elapsed the
/// count becomes the published rate and the window restarts. A window that
/// stayed open for two or more periods without being rolled publishes zero,
/// since the events it holds no longer describe the last second.
#[derive(Debug, Clone)]
pub struct ThroughputSample {
    window: Duration,
    window_start: Option<Instant>,
    count: u32,
    rate: u32,
}

impl ThroughputSample {
    pub fn per_second() -> Self {
        Self::with_window(THROUGHPUT_WINDOW)
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            window,
            window_start: None,
            count: 0,
            rate: 0,
        }
    }

    /// Counts one event at `now`, rolling the window first if it elapsed.
    pub fn record(&mut self, now: Instant) {
        self.roll(now);
        self.count = self.count.saturating_add(1);
    }

    /// Closes the current window if it has elapsed.
    pub fn roll(&mut self, now: Instant) {
        let Some(start) = self.window_start else {
            self.window_start = Some(now);
            return;
        };

        let elapsed = now.saturating_duration_since(start);
        if elapsed < self.window {
            return;
        }

        self.rate = if elapsed < self.window * 2 {
            self.count
        } else {
            0
        };
        self.count = 0;
        self.window_start = Some(now);
    }

    /// Rate published by the last completed window.
    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Events counted in the still-open window.
    pub fn pending(&self) -> u32 {
        self.count
    }

    pub fn reset(&mut self) {
        self.window_start = None;
        self.count = 0;
        self.rate = 0;
    }
}

impl Default for ThroughputSample {
    fn default() -> Self {
        Self::per_second()
    }
}
