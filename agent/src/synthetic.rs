//! Test-pattern cameras for hosts without a capture backend.

use framelink_core::device::{DeviceCapability, FrameSource, StreamConstraints, VideoDevice};
use framelink_core::encoder::RawFrame;
use framelink_core::error::{CoreError, CoreResult};

/// Grabs that return nothing while the source warms up.
const WARMUP_GRABS: u32 = 2;

/// Moving colour bars at the requested geometry.
pub struct TestPatternSource {
    width: u32,
    height: u32,
    seed: u8,
    grabs: u32,
    stopped: bool,
}

impl TestPatternSource {
    pub fn new(width: u32, height: u32, seed: u8) -> Self {
        Self {
            width,
            height,
            seed,
            grabs: 0,
            stopped: false,
        }
    }

    fn render(&self) -> RawFrame {
        let width = self.width.max(1);
        let height = self.height.max(1);
        let shift = self.grabs.wrapping_mul(4) % width;
        let mut rgb = Vec::with_capacity(self.width as usize * self.height as usize * 3);
        for y in 0..self.height {
            for x in 0..self.width {
                let bar = ((x + shift) % width * 8 / width) as u8;
                rgb.extend_from_slice(&[
                    bar.wrapping_mul(32),
                    (u64::from(y) * 255 / u64::from(height)) as u8,
                    self.seed.wrapping_mul(85).wrapping_add(bar),
                ]);
            }
        }
        RawFrame::new(self.width, self.height, rgb)
    }
}

impl FrameSource for TestPatternSource {
    fn is_ready(&self) -> bool {
        !self.stopped
    }

    fn grab(&mut self) -> Option<RawFrame> {
        if self.stopped {
            return None;
        }
        self.grabs += 1;
        if self.grabs <= WARMUP_GRABS {
            return None;
        }
        Some(self.render())
    }

    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            tracing::debug!(seed = self.seed, "test pattern stopped");
        }
    }
}

/// Exposes `count` synthetic cameras.
#[derive(Debug, Clone)]
pub struct SyntheticCapability {
    devices: Vec<VideoDevice>,
}

impl SyntheticCapability {
    pub fn new(count: usize) -> Self {
        Self {
            devices: (0..count)
                .map(|index| {
                    VideoDevice::new(format!("synthetic-{index}"), format!("Test Pattern {index}"))
                })
                .collect(),
        }
    }
}

#[async_trait::async_trait(?Send)]
impl DeviceCapability for SyntheticCapability {
    async fn request_video_access(&self) -> CoreResult<()> {
        Ok(())
    }

    async fn enumerate_video_devices(&self) -> CoreResult<Vec<VideoDevice>> {
        Ok(self.devices.clone())
    }

    async fn open_stream(
        &self,
        device_id: Option<&str>,
        constraints: StreamConstraints,
    ) -> CoreResult<Box<dyn FrameSource>> {
        let index = match device_id {
            None if self.devices.is_empty() => return Err(CoreError::NoDeviceFound),
            None => 0,
            Some(id) => self
                .devices
                .iter()
                .position(|device| device.id == id)
                .ok_or_else(|| CoreError::CaptureUnavailable(format!("unknown device {id}")))?,
        };
        Ok(Box::new(TestPatternSource::new(
            constraints.ideal_width,
            constraints.ideal_height,
            index as u8,
        )))
    }
}
