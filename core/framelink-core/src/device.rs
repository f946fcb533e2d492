//! Video source management.
//!
//! The platform side (permission grant, enumeration, opening a live stream) is
//! abstracted behind [`DeviceCapability`]; [`VideoSourceManager`] owns the one
//! [`CaptureSession`] that may exist at a time.

use crate::encoder::RawFrame;
use crate::error::{CoreError, CoreResult};
use serde::Serialize;
use std::fmt;

/// A camera as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VideoDevice {
    pub id: String,
    pub display_name: String,
}

impl VideoDevice {
    /// Builds a device entry, falling back to `Camera <id>` for unlabeled devices.
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        let id = id.into();
        let label = label.into();
        let display_name = if label.trim().is_empty() {
            format!("Camera {id}")
        } else {
            label
        };
        Self { id, display_name }
    }
}

/// Preferred stream geometry; the platform may pick something else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConstraints {
    pub ideal_width: u32,
    pub ideal_height: u32,
}

impl Default for StreamConstraints {
    fn default() -> Self {
        Self {
            ideal_width: 640,
            ideal_height: 480,
        }
    }
}

/// A live frame source returned by the platform.
pub trait FrameSource {
    /// Whether the source has buffered enough data to produce a frame.
    fn is_ready(&self) -> bool;
    /// Grabs the current frame, if any.
    fn grab(&mut self) -> Option<RawFrame>;
    /// Stops all underlying tracks. Must be idempotent.
    fn stop(&mut self);
}

/// Platform hook for device access.
#[async_trait::async_trait(?Send)]
pub trait DeviceCapability {
    async fn request_video_access(&self) -> CoreResult<()>;
    async fn enumerate_video_devices(&self) -> CoreResult<Vec<VideoDevice>>;
    async fn open_stream(
        &self,
        device_id: Option<&str>,
        constraints: StreamConstraints,
    ) -> CoreResult<Box<dyn FrameSource>>;
}

/// The active device handle plus its live stream. Dropping it stops the stream.
pub struct CaptureSession {
    device_id: Option<String>,
    source: Box<dyn FrameSource>,
}

impl CaptureSession {
    /// `None` when the platform default device was opened.
    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn is_ready(&self) -> bool {
        self.source.is_ready()
    }

    pub fn grab(&mut self) -> Option<RawFrame> {
        self.source.grab()
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.source.stop();
    }
}

impl fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureSession")
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

/// Result of the startup acquisition flow.
#[derive(Debug)]
pub enum StartupOutcome {
    /// A device was enumerated, selected and opened.
    Acquired,
    /// The access check or enumeration failed; the platform default device
    /// was opened instead.
    DefaultFallback { cause: CoreError },
    /// No device could be opened.
    Failed(CoreError),
}

/// Owns device enumeration, selection and the single capture session.
pub struct VideoSourceManager<D: DeviceCapability> {
    capability: D,
    constraints: StreamConstraints,
    devices: Vec<VideoDevice>,
    selected_device_id: Option<String>,
    session: Option<CaptureSession>,
}

impl<D: DeviceCapability> VideoSourceManager<D> {
    pub fn new(capability: D, constraints: StreamConstraints) -> Self {
        Self {
            capability,
            constraints,
            devices: Vec::new(),
            selected_device_id: None,
            session: None,
        }
    }

    pub fn capability(&self) -> &D {
        &self.capability
    }

    pub fn devices(&self) -> &[VideoDevice] {
        &self.devices
    }

    pub fn selected_device_id(&self) -> Option<&str> {
        self.selected_device_id.as_deref()
    }

    pub fn session(&self) -> Option<&CaptureSession> {
        self.session.as_ref()
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    pub fn is_source_ready(&self) -> bool {
        self.session.as_ref().is_some_and(CaptureSession::is_ready)
    }

    pub fn grab_frame(&mut self) -> Option<RawFrame> {
        self.session.as_mut().and_then(CaptureSession::grab)
    }

    /// Requests a transient grant and enumerates video inputs.
    pub async fn list_devices(&self) -> CoreResult<Vec<VideoDevice>> {
        self.capability.request_video_access().await?;
        let devices = self.capability.enumerate_video_devices().await?;
        if devices.is_empty() {
            return Err(CoreError::NoDeviceFound);
        }
        Ok(devices)
    }

    /// Opens a live stream, releasing any previous session first.
    ///
    /// A denied grant stays `PermissionDenied`; every other failure becomes
    /// `CaptureUnavailable`.
    pub async fn acquire(&mut self, device_id: Option<&str>) -> CoreResult<&CaptureSession> {
        self.release();

        let source = self
            .capability
            .open_stream(device_id, self.constraints)
            .await
            .map_err(|err| match err {
                CoreError::CaptureUnavailable(_) | CoreError::PermissionDenied => err,
                other => CoreError::CaptureUnavailable(other.to_string()),
            })?;

        tracing::info!(device = device_id.unwrap_or("default"), "capture session opened");
        Ok(&*self.session.insert(CaptureSession {
            device_id: device_id.map(str::to_owned),
            source,
        }))
    }

    /// Stops the active session, if any.
    pub fn release(&mut self) {
        if let Some(session) = self.session.take() {
            let device = session.device_id().unwrap_or("default");
            tracing::debug!(device, "capture session released");
        }
    }

    /// Tears down the current session and opens `device_id`.
    ///
    /// On failure no session remains open; the selection still records the
    /// requested device so a later refresh or retry targets it.
    pub async fn switch_device(&mut self, device_id: &str) -> CoreResult<()> {
        self.selected_device_id = Some(device_id.to_owned());
        match self.acquire(Some(device_id)).await {
            Ok(_) => Ok(()),
            Err(err) => Err(CoreError::DeviceSwitchFailed {
                device_id: device_id.to_owned(),
                reason: err.to_string(),
            }),
        }
    }

    /// Re-enumerates without a new grant; selects and opens the first device if
    /// nothing was selected yet.
    pub async fn refresh_devices(&mut self) -> CoreResult<()> {
        self.devices = self.capability.enumerate_video_devices().await?;
        if self.selected_device_id.is_some() {
            return Ok(());
        }
        match self.devices.first().map(|device| device.id.clone()) {
            Some(first) => self.switch_device(&first).await,
            None => Ok(()),
        }
    }

    /// Label-unlocking grant, enumeration and initial acquisition.
    pub async fn startup(&mut self) -> StartupOutcome {
        match self.unlock_and_enumerate().await {
            Ok(devices) => {
                self.devices = devices;
                let pick = self
                    .selected_device_id
                    .clone()
                    .filter(|id| self.devices.iter().any(|device| &device.id == id))
                    .or_else(|| self.devices.first().map(|device| device.id.clone()));
                self.selected_device_id = pick.clone();

                match self.acquire(pick.as_deref()).await {
                    Ok(_) => StartupOutcome::Acquired,
                    Err(err) => StartupOutcome::Failed(err),
                }
            }
            Err(cause) => {
                tracing::warn!(error = %cause, "device enumeration failed, trying default camera");
                if matches!(cause, CoreError::NoDeviceFound) {
                    self.devices.clear();
                }
                match self.acquire(None).await {
                    Ok(_) => StartupOutcome::DefaultFallback { cause },
                    Err(err) => StartupOutcome::Failed(err),
                }
            }
        }
    }

    /// Opens and immediately stops a default stream so enumeration exposes labels.
    async fn unlock_and_enumerate(&mut self) -> CoreResult<Vec<VideoDevice>> {
        self.release();
        self.capability.request_video_access().await?;
        let mut grant = self.capability.open_stream(None, self.constraints).await?;
        grant.stop();
        self.list_devices().await
    }
}
