//! Wire encoding of the inference-service protocol.
//!
//! Outbound frames travel as a binary message (tier byte, big-endian
//! sequence, JPEG bytes) or, when binary transmission fails, as a JSON text
//! message carrying the same JPEG as a base64 data URL. Results come back as
//! JSON text.

use crate::error::{CoreError, CoreResult};
use crate::reconciler::{Detection, InboundResult};
use crate::scheduler::FrameTier;
use base64::Engine;
use serde::Deserialize;

pub const TIER_KEYFRAME: u8 = 0x01;
pub const TIER_INTERFRAME: u8 = 0x02;
/// Tier byte plus the 8-byte sequence.
pub const BINARY_HEADER_LEN: usize = 9;

/// One encoded frame on its way to the service.
#[derive(Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    pub sequence: u64,
    pub tier: FrameTier,
    pub payload: Vec<u8>,
}

impl std::fmt::Debug for OutboundFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundFrame")
            .field("sequence", &self.sequence)
            .field("tier", &self.tier)
            .field("bytes", &self.payload.len())
            .finish()
    }
}

fn tier_byte(tier: FrameTier) -> u8 {
    match tier {
        FrameTier::Keyframe => TIER_KEYFRAME,
        FrameTier::Interframe => TIER_INTERFRAME,
    }
}

fn tier_name(tier: FrameTier) -> &'static str {
    match tier {
        FrameTier::Keyframe => "keyframe",
        FrameTier::Interframe => "interframe",
    }
}

pub fn encode_binary_frame(frame: &OutboundFrame) -> Vec<u8> {
    let mut out = Vec::with_capacity(BINARY_HEADER_LEN + frame.payload.len());
    out.push(tier_byte(frame.tier));
    out.extend_from_slice(&frame.sequence.to_be_bytes());
    out.extend_from_slice(&frame.payload);
    out
}

pub fn decode_binary_frame(bytes: &[u8]) -> CoreResult<OutboundFrame> {
    if bytes.len() < BINARY_HEADER_LEN {
        return Err(CoreError::Protocol(format!(
            "binary frame of {} bytes is shorter than its header",
            bytes.len()
        )));
    }
    let tier = match bytes[0] {
        TIER_KEYFRAME => FrameTier::Keyframe,
        TIER_INTERFRAME => FrameTier::Interframe,
        other => return Err(CoreError::Protocol(format!("unknown tier byte {other:#04x}"))),
    };
    let mut sequence = [0u8; 8];
    sequence.copy_from_slice(&bytes[1..BINARY_HEADER_LEN]);
    Ok(OutboundFrame {
        sequence: u64::from_be_bytes(sequence),
        tier,
        payload: bytes[BINARY_HEADER_LEN..].to_vec(),
    })
}

pub fn data_url(mime: &str, bytes: &[u8]) -> String {
    format!(
        "data:{mime};base64,{}",
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}

/// Textual fallback carrying the same JPEG payload.
pub fn encode_text_frame(frame: &OutboundFrame) -> String {
    serde_json::json!({
        "event": "image",
        "sequence": frame.sequence,
        "tier": tier_name(frame.tier),
        "data": data_url("image/jpeg", &frame.payload),
    })
    .to_string()
}

/// A decoded service reply.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Result(InboundResult),
    Error(String),
}

#[derive(Debug, Deserialize)]
struct WireReply {
    #[serde(default)]
    frame: Option<String>,
    #[serde(default)]
    detections: Option<Vec<Detection>>,
    #[serde(default)]
    count: Option<usize>,
    #[serde(default, alias = "seq")]
    sequence: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

pub fn decode_inbound(text: &str) -> CoreResult<InboundMessage> {
    let reply: WireReply = serde_json::from_str(text)
        .map_err(|err| CoreError::Protocol(format!("malformed reply: {err}")))?;

    if let Some(error) = reply.error {
        return Ok(InboundMessage::Error(error));
    }

    let frame = reply
        .frame
        .ok_or_else(|| CoreError::Protocol("reply carries neither frame nor error".into()))?;

    let mut detections = reply.detections.unwrap_or_default();
    for detection in &mut detections {
        detection.confidence = if detection.confidence.is_nan() {
            0.0
        } else {
            detection.confidence.clamp(0.0, 1.0)
        };
    }
    if let Some(count) = reply.count {
        if count != detections.len() {
            tracing::debug!(count, received = detections.len(), "detection count mismatch");
        }
    }

    Ok(InboundMessage::Result(InboundResult {
        frame,
        detections,
        sequence: reply.sequence,
    }))
}
