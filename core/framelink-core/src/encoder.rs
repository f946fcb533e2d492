use crate::error::{CoreError, CoreResult};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{ExtendedColorType, ImageBuffer, Rgb};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

/// A single RGB8 frame grabbed from a live source.
#[derive(Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
}

impl RawFrame {
    pub fn new(width: u32, height: u32, rgb: Vec<u8>) -> Self {
        Self { width, height, rgb }
    }

    fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    /// A frame without a full pixel buffer means the source is not producing yet.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.rgb.len() < self.expected_len()
    }
}

impl fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.rgb.len())
            .finish()
    }
}

/// Output dimensions of an encoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const VGA: Resolution = Resolution::new(640, 480);
    pub const QVGA: Resolution = Resolution::new(320, 240);

    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_zero(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Maps a (0, 1] quality factor onto the JPEG 1..=100 scale.
pub fn jpeg_quality(quality: f32) -> u8 {
    (quality * 100.0).round().clamp(1.0, 100.0) as u8
}

/// Stateless frame compressor.
pub trait FrameEncoder {
    /// Encodes `frame` scaled to `resolution`.
    ///
    /// Returns `Ok(None)` when the frame carries no pixels yet; callers treat
    /// that as a skipped tick rather than a failure.
    fn encode(
        &self,
        frame: &RawFrame,
        resolution: Resolution,
        quality: f32,
    ) -> CoreResult<Option<Vec<u8>>>;
}

/// JPEG encoder backed by the `image` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct JpegFrameEncoder;

impl FrameEncoder for JpegFrameEncoder {
    fn encode(
        &self,
        frame: &RawFrame,
        resolution: Resolution,
        quality: f32,
    ) -> CoreResult<Option<Vec<u8>>> {
        if frame.is_empty() {
            return Ok(None);
        }
        if resolution.is_zero() {
            return Err(CoreError::Encode(format!(
                "target resolution {}x{} has no area",
                resolution.width, resolution.height
            )));
        }

        let source = &frame.rgb[..frame.expected_len()];
        let pixels: Cow<'_, [u8]> =
            if frame.width == resolution.width && frame.height == resolution.height {
                Cow::Borrowed(source)
            } else {
                let view =
                    ImageBuffer::<Rgb<u8>, &[u8]>::from_raw(frame.width, frame.height, source)
                        .ok_or_else(|| {
                            CoreError::Encode("pixel buffer does not match frame".into())
                        })?;
                let scaled = imageops::resize(
                    &view,
                    resolution.width,
                    resolution.height,
                    FilterType::Triangle,
                );
                Cow::Owned(scaled.into_raw())
            };

        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, jpeg_quality(quality))
            .encode(
                &pixels,
                resolution.width,
                resolution.height,
                ExtendedColorType::Rgb8,
            )
            .map_err(|err| CoreError::Encode(err.to_string()))?;
        Ok(Some(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> RawFrame {
        let mut rgb = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                rgb.push((x * 255 / width.max(1)) as u8);
                rgb.push((y * 255 / height.max(1)) as u8);
                rgb.push(128);
            }
        }
        RawFrame::new(width, height, rgb)
    }

    #[test]
    fn encodes_jpeg_at_requested_resolution() {
        let encoded = JpegFrameEncoder
            .encode(&gradient(64, 48), Resolution::new(32, 24), 0.7)
            .unwrap()
            .expect("frame has pixels");

        assert_eq!(&encoded[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&encoded).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 24));
    }

    #[test]
    fn same_size_frame_is_encoded_without_scaling() {
        let encoded = JpegFrameEncoder
            .encode(&gradient(40, 30), Resolution::new(40, 30), 0.9)
            .unwrap()
            .unwrap();
        let decoded = image::load_from_memory(&encoded).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (40, 30));
    }

    #[test]
    fn empty_frame_is_a_silent_skip() {
        let empty = RawFrame::new(0, 0, Vec::new());
        assert!(JpegFrameEncoder
            .encode(&empty, Resolution::QVGA, 0.7)
            .unwrap()
            .is_none());

        let truncated = RawFrame::new(4, 4, vec![0; 10]);
        assert!(JpegFrameEncoder
            .encode(&truncated, Resolution::QVGA, 0.7)
            .unwrap()
            .is_none());
    }

    #[test]
    fn zero_target_resolution_is_rejected() {
        let err = JpegFrameEncoder
            .encode(&gradient(8, 8), Resolution::new(0, 10), 0.7)
            .unwrap_err();
        assert!(matches!(err, CoreError::Encode(_)));
    }

    #[test]
    fn quality_maps_onto_jpeg_scale() {
        assert_eq!(jpeg_quality(0.9), 90);
        assert_eq!(jpeg_quality(0.7), 70);
        assert_eq!(jpeg_quality(0.0), 1);
        assert_eq!(jpeg_quality(1.5), 100);
    }
}
