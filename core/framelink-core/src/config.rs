use crate::channel::ChannelOptions;
use crate::device::StreamConstraints;
use crate::reconciler::TRAILING_WINDOW_DEPTH;
use crate::scheduler::{BackpressurePolicy, EncodingPolicy, DEFAULT_IN_FLIGHT_TIMEOUT};

pub const DEFAULT_ENDPOINT: &str = "ws://localhost:8080/ws";

/// Everything a [`LiveEngine`](crate::LiveEngine) needs to run a client session.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub endpoint: String,
    pub channel: ChannelOptions,
    pub policy: EncodingPolicy,
    pub backpressure: BackpressurePolicy,
    /// Single-flight only: how long to wait for a result before sending again.
    pub in_flight_timeout_ms: u64,
    pub constraints: StreamConstraints,
    /// Drop results whose sequence is not newer than the displayed one.
    pub drop_stale_results: bool,
    pub trailing_window: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            channel: ChannelOptions::default(),
            policy: EncodingPolicy::default(),
            backpressure: BackpressurePolicy::default(),
            in_flight_timeout_ms: DEFAULT_IN_FLIGHT_TIMEOUT.as_millis() as u64,
            constraints: StreamConstraints::default(),
            drop_stale_results: false,
            trailing_window: TRAILING_WINDOW_DEPTH,
        }
    }
}

impl ClientConfig {
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }
}
