//! User-visible state: the two error surfaces and the published snapshot.

use crate::channel::ChannelState;
use crate::device::VideoDevice;
use crate::error::CoreError;
use crate::reconciler::Detection;
use crate::scheduler::SchedulerState;
use serde::Serialize;

pub const CAMERA_PERMISSION_MESSAGE: &str =
    "Unable to access camera. Please grant camera permissions.";
pub const CAMERA_SWITCH_MESSAGE: &str = "Failed to switch camera. Check permissions.";
pub const DEFAULT_CAMERA_MESSAGE: &str =
    "Using default camera; device selection may not be supported in this environment.";
pub const NO_CAMERA_MESSAGE: &str =
    "Unable to access any camera. Check permissions or connect a device.";

pub fn connection_failed_message(endpoint: &str) -> String {
    format!("Failed to connect to server. Make sure the server is running on {endpoint}")
}

pub fn reconnect_exhausted_message(attempts: u32) -> String {
    format!(
        "Reconnection attempts exhausted after {attempts} tries. \
         Restart the inference service and reconnect."
    )
}

/// Message shown on the camera surface for a capture-path failure.
pub fn camera_message(err: &CoreError) -> &'static str {
    match err {
        CoreError::PermissionDenied => CAMERA_PERMISSION_MESSAGE,
        CoreError::DeviceSwitchFailed { .. } => CAMERA_SWITCH_MESSAGE,
        _ => NO_CAMERA_MESSAGE,
    }
}

/// Camera and connection errors, set and cleared independently.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrorSurfaces {
    camera: Option<String>,
    connection: Option<String>,
}

impl ErrorSurfaces {
    pub fn camera(&self) -> Option<&str> {
        self.camera.as_deref()
    }

    pub fn connection(&self) -> Option<&str> {
        self.connection.as_deref()
    }

    pub fn set_camera(&mut self, message: impl Into<String>) {
        self.camera = Some(message.into());
    }

    pub fn clear_camera(&mut self) {
        self.camera = None;
    }

    pub fn set_connection(&mut self, message: impl Into<String>) {
        self.connection = Some(message.into());
    }

    pub fn clear_connection(&mut self) {
        self.connection = None;
    }
}

/// Snapshot of the engine for a UI or the agent's status endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStatus {
    pub channel_state: ChannelState,
    pub scheduler_state: SchedulerState,
    pub target_rate_hz: u32,
    pub tick_period_ms: u64,
    pub frames_sent: u64,
    pub sent_fps: u32,
    pub received_fps: u32,
    pub devices: Vec<VideoDevice>,
    pub selected_device_id: Option<String>,
    pub camera_error: Option<String>,
    pub connection_error: Option<String>,
    pub detections: Vec<Detection>,
    pub annotated_frame_available: bool,
    pub last_sequence: Option<u64>,
    pub trailing_results: usize,
    pub stale_results_dropped: u64,
    pub service_error: Option<String>,
}

impl Default for EngineStatus {
    fn default() -> Self {
        Self {
            channel_state: ChannelState::Closed,
            scheduler_state: SchedulerState::Idle,
            target_rate_hz: 0,
            tick_period_ms: 0,
            frames_sent: 0,
            sent_fps: 0,
            received_fps: 0,
            devices: Vec::new(),
            selected_device_id: None,
            camera_error: None,
            connection_error: None,
            detections: Vec::new(),
            annotated_frame_available: false,
            last_sequence: None,
            trailing_results: 0,
            stale_results_dropped: 0,
            service_error: None,
        }
    }
}
