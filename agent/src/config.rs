use framelink_core::config::ClientConfig;
use framelink_core::scheduler::BackpressurePolicy;
use std::net::SocketAddr;
use std::str::FromStr;

/// Agent settings read from `FRAMELINK_*` environment variables.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub client: ClientConfig,
    pub bind_host: String,
    pub bind_port: u16,
    pub web_origin: String,
    pub synthetic_cameras: usize,
}

impl AgentConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut client = ClientConfig::default();
        if let Some(endpoint) = lookup("FRAMELINK_ENDPOINT") {
            client.endpoint = endpoint;
        }
        if let Some(hz) = parsed(&lookup, "FRAMELINK_TARGET_FPS") {
            client.policy.target_rate_hz = hz;
        }
        if let Some(interval) = parsed(&lookup, "FRAMELINK_KEYFRAME_INTERVAL") {
            client.policy.keyframe_interval = interval;
        }
        if let Some(true) = parsed::<bool>(&lookup, "FRAMELINK_SINGLE_FLIGHT") {
            client.backpressure = BackpressurePolicy::SingleFlight;
        }
        if let Some(timeout) = parsed(&lookup, "FRAMELINK_IN_FLIGHT_TIMEOUT_MS") {
            client.in_flight_timeout_ms = timeout;
        }
        if let Some(drop_stale) = parsed(&lookup, "FRAMELINK_DROP_STALE_RESULTS") {
            client.drop_stale_results = drop_stale;
        }
        if let Some(attempts) = parsed(&lookup, "FRAMELINK_RECONNECT_ATTEMPTS") {
            client.channel.max_reconnect_attempts = attempts;
        }
        if let Some(delay) = parsed(&lookup, "FRAMELINK_RECONNECT_DELAY_MS") {
            client.channel.reconnect_delay_ms = delay;
        }
        if let Some(delay) = parsed(&lookup, "FRAMELINK_RECONNECT_DELAY_MAX_MS") {
            client.channel.max_reconnect_delay_ms = delay;
        }
        if let Some(timeout) = parsed(&lookup, "FRAMELINK_CONNECT_TIMEOUT_MS") {
            client.channel.connect_timeout_ms = timeout;
        }

        Self {
            client,
            bind_host: lookup("FRAMELINK_BIND_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            bind_port: parsed(&lookup, "FRAMELINK_BIND_PORT").unwrap_or(8081),
            web_origin: lookup("FRAMELINK_WEB_ORIGIN")
                .unwrap_or_else(|| "http://localhost:3000".to_string()),
            synthetic_cameras: parsed(&lookup, "FRAMELINK_SYNTHETIC_CAMERAS").unwrap_or(1),
        }
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(format!("{}:{}", self.bind_host, self.bind_port).parse()?)
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}
