use crate::encoder::Resolution;
use crate::error::{CoreError, CoreResult};
use crate::throughput::ThroughputSample;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior};

/// Lower bound on the capture period regardless of the requested rate.
pub const MIN_TICK_PERIOD: Duration = Duration::from_millis(50);

/// How long a single-flight frame may go unanswered before capture resumes.
pub const DEFAULT_IN_FLIGHT_TIMEOUT: Duration = Duration::from_secs(2);

/// Capture period for a target rate: `max(50ms, round(1000 / hz))`.
/// A rate of zero is treated as 1 Hz.
pub fn tick_period(target_rate_hz: u32) -> Duration {
    let hz = target_rate_hz.max(1);
    let millis = (1_000.0 / f64::from(hz)).round() as u64;
    Duration::from_millis(millis).max(MIN_TICK_PERIOD)
}

/// Every `keyframe_interval`-th tick, starting with tick 0, is a keyframe.
pub fn tier_for_tick(tick: u64, keyframe_interval: u32) -> FrameTier {
    if tick % u64::from(keyframe_interval.max(1)) == 0 {
        FrameTier::Keyframe
    } else {
        FrameTier::Interframe
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    Idle,
    Running,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameTier {
    Keyframe,
    Interframe,
}

/// Resolution and quality used for one tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EncodingTier {
    pub resolution: Resolution,
    pub quality: f32,
}

/// Adaptive dual-tier capture policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodingPolicy {
    pub target_rate_hz: u32,
    pub keyframe_interval: u32,
    pub keyframe: EncodingTier,
    pub interframe: EncodingTier,
}

impl Default for EncodingPolicy {
    fn default() -> Self {
        Self {
            target_rate_hz: 5,
            keyframe_interval: 10,
            keyframe: EncodingTier {
                resolution: Resolution::VGA,
                quality: 0.9,
            },
            interframe: EncodingTier {
                resolution: Resolution::QVGA,
                quality: 0.7,
            },
        }
    }
}

impl EncodingPolicy {
    pub fn validate(&self) -> CoreResult<()> {
        if self.keyframe_interval == 0 {
            return Err(CoreError::InvalidPolicy(
                "keyframe interval must be at least 1".into(),
            ));
        }
        for (name, tier) in [("keyframe", &self.keyframe), ("interframe", &self.interframe)] {
            if tier.resolution.is_zero() {
                return Err(CoreError::InvalidPolicy(format!(
                    "{name} resolution has no area"
                )));
            }
            if !(tier.quality > 0.0 && tier.quality <= 1.0) {
                return Err(CoreError::InvalidPolicy(format!(
                    "{name} quality {} outside (0, 1]",
                    tier.quality
                )));
            }
        }
        Ok(())
    }

    pub fn tier(&self, tier: FrameTier) -> EncodingTier {
        match tier {
            FrameTier::Keyframe => self.keyframe,
            FrameTier::Interframe => self.interframe,
        }
    }

    pub fn tick_period(&self) -> Duration {
        tick_period(self.target_rate_hz)
    }
}

/// How many frames may await a result at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Send on every tick; the service keeps only the latest frame.
    #[default]
    Continuous,
    /// Skip ticks while a sent frame has not produced a result yet.
    SingleFlight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotRunning,
    ChannelNotOpen,
    SourceNotReady,
    NoFrame,
    AwaitingResult,
    EncodeFailed,
    QueueFull,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Sent {
        sequence: u64,
        tier: FrameTier,
        bytes: usize,
    },
    Skipped(SkipReason),
}

/// What the next tick should capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickPlan {
    pub sequence: u64,
    pub tier: FrameTier,
}

/// Run/pause state, tick counter and tier selection for capture cycles.
#[derive(Debug)]
pub struct CaptureScheduler {
    state: SchedulerState,
    policy: EncodingPolicy,
    backpressure: BackpressurePolicy,
    tick: u64,
    in_flight_since: Option<Instant>,
    in_flight_timeout: Duration,
    sent: ThroughputSample,
}

impl CaptureScheduler {
    pub fn new(policy: EncodingPolicy, backpressure: BackpressurePolicy) -> CoreResult<Self> {
        policy.validate()?;
        Ok(Self {
            state: SchedulerState::Idle,
            policy,
            backpressure,
            tick: 0,
            in_flight_since: None,
            in_flight_timeout: DEFAULT_IN_FLIGHT_TIMEOUT,
            sent: ThroughputSample::per_second(),
        })
    }

    pub fn with_in_flight_timeout(mut self, timeout: Duration) -> Self {
        self.in_flight_timeout = timeout;
        self
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == SchedulerState::Running
    }

    pub fn policy(&self) -> &EncodingPolicy {
        &self.policy
    }

    pub fn backpressure(&self) -> BackpressurePolicy {
        self.backpressure
    }

    /// Number of frames handed to the channel since the last teardown.
    pub fn tick_count(&self) -> u64 {
        self.tick
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight_since.is_some()
    }

    pub fn period(&self) -> Duration {
        self.policy.tick_period()
    }

    /// Fresh repeating timer for the current period. Missed ticks are skipped.
    pub fn new_interval(&self) -> Interval {
        let mut interval = tokio::time::interval(self.period());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval
    }

    /// Leaves `Idle`: running if capture and channel are both ready, paused otherwise.
    pub fn arm(&mut self, ready: bool) -> SchedulerState {
        if self.state == SchedulerState::Idle {
            self.state = if ready {
                SchedulerState::Running
            } else {
                SchedulerState::Paused
            };
            tracing::debug!(state = ?self.state, "capture scheduler armed");
        }
        self.state
    }

    /// Applies a readiness change. `Idle` is only left through [`arm`](Self::arm).
    pub fn update_readiness(&mut self, ready: bool) -> SchedulerState {
        let next = match (self.state, ready) {
            (SchedulerState::Running, false) => SchedulerState::Paused,
            (SchedulerState::Paused, true) => SchedulerState::Running,
            (state, _) => state,
        };
        if next != self.state {
            tracing::info!(from = ?self.state, to = ?next, "capture scheduler state changed");
            if next == SchedulerState::Paused {
                self.in_flight_since = None;
            }
            self.state = next;
        }
        self.state
    }

    /// Returns to `Idle` and forgets all per-run counters.
    pub fn teardown(&mut self) {
        self.state = SchedulerState::Idle;
        self.tick = 0;
        self.in_flight_since = None;
        self.sent.reset();
    }

    /// Replaces the target rate. Returns whether the tick period changed.
    pub fn set_target_rate(&mut self, target_rate_hz: u32) -> CoreResult<bool> {
        let policy = EncodingPolicy {
            target_rate_hz,
            ..self.policy.clone()
        };
        self.set_policy(policy)
    }

    /// Replaces the whole policy. Returns whether the tick period changed.
    pub fn set_policy(&mut self, policy: EncodingPolicy) -> CoreResult<bool> {
        policy.validate()?;
        let changed = policy.tick_period() != self.period();
        self.policy = policy;
        Ok(changed)
    }

    /// Decides whether the next tick captures and at which tier.
    pub fn plan_tick(&self, source_ready: bool) -> Result<TickPlan, SkipReason> {
        if self.state != SchedulerState::Running {
            return Err(SkipReason::NotRunning);
        }
        if !source_ready {
            return Err(SkipReason::SourceNotReady);
        }
        if self.backpressure == BackpressurePolicy::SingleFlight && self.in_flight() {
            return Err(SkipReason::AwaitingResult);
        }
        Ok(TickPlan {
            sequence: self.tick,
            tier: tier_for_tick(self.tick, self.policy.keyframe_interval),
        })
    }

    /// Records a frame handed to the channel.
    pub fn complete_tick(&mut self, now: Instant) {
        self.tick += 1;
        if self.backpressure == BackpressurePolicy::SingleFlight {
            self.in_flight_since = Some(now);
        }
        self.sent.record(now);
    }

    /// A result, a service error or channel loss ends the in-flight wait.
    pub fn release_in_flight(&mut self) {
        self.in_flight_since = None;
    }

    /// Gives up on an unanswered frame once the in-flight timeout has passed.
    /// Returns whether a wait was abandoned.
    pub fn expire_in_flight(&mut self, now: Instant) -> bool {
        match self.in_flight_since {
            Some(since) if now.saturating_duration_since(since) >= self.in_flight_timeout => {
                tracing::warn!(
                    timeout_ms = self.in_flight_timeout.as_millis() as u64,
                    "no result for in-flight frame, resuming capture"
                );
                self.in_flight_since = None;
                true
            }
            _ => false,
        }
    }

    pub fn roll_throughput(&mut self, now: Instant) {
        self.sent.roll(now);
    }

    pub fn sent_rate(&self) -> u32 {
        self.sent.rate()
    }
}
