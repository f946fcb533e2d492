use crate::channel::ChannelState;
use thiserror::Error;

/// Core engine errors.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("video access permission denied")]
    PermissionDenied,
    #[error("no video device found")]
    NoDeviceFound,
    #[error("capture unavailable: {0}")]
    CaptureUnavailable(String),
    #[error("failed to switch to device {device_id}: {reason}")]
    DeviceSwitchFailed { device_id: String, reason: String },
    #[error("connect timed out after {timeout_ms} ms")]
    ConnectTimeout { timeout_ms: u64 },
    #[error("connection error: {0}")]
    ConnectionError(String),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("invalid encoding policy: {0}")]
    InvalidPolicy(String),
    #[error("invalid channel transition: {from:?} -> {to:?}")]
    InvalidTransition { from: ChannelState, to: ChannelState },
    #[error("reconnection attempts exhausted after {attempts} tries")]
    ReconnectExhausted { attempts: u32 },
    #[error("channel driver is no longer running")]
    ChannelClosed,
}

impl CoreError {
    /// Whether the error belongs to the capture path rather than the transport path.
    pub fn is_camera_error(&self) -> bool {
        matches!(
            self,
            CoreError::PermissionDenied
                | CoreError::NoDeviceFound
                | CoreError::CaptureUnavailable(_)
                | CoreError::DeviceSwitchFailed { .. }
        )
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
