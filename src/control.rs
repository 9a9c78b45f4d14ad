//! Control-channel message codec and command routing.
//!
//! Messages are a 1-byte tag, a 4-byte big-endian payload length, and a
//! JSON payload. JSON keeps each tag self-describing, so unknown tags
//! can be skipped without breaking older peers.

use crate::errors::{Result, StreamError};
use crate::peer::PeerSession;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fixed control header size: tag + payload length.
pub const CONTROL_HEADER_SIZE: usize = 5;

/// Upper bound on control payloads; anything larger is a framing error.
pub const MAX_CONTROL_PAYLOAD: usize = 64 * 1024;

/// Known control tags. Inbound tags outside this set are ignored.
pub mod tags {
    pub const REQUEST_KEYFRAME: u8 = 0x01;
    pub const SET_BITRATE: u8 = 0x02;
    pub const SET_RESOLUTION: u8 = 0x03;
    pub const INPUT_EVENT: u8 = 0x04;
    pub const SESSION_TERMINATE: u8 = 0x05;
    pub const TELEMETRY: u8 = 0x10;
}

/// One tagged control-channel message.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlMessage {
    pub tag: u8,
    pub payload: serde_json::Value,
}

impl ControlMessage {
    pub fn new(tag: u8, payload: serde_json::Value) -> Self {
        Self { tag, payload }
    }

    /// Serialize for the reliable data channel.
    pub fn encode(&self) -> Result<Bytes> {
        let body = serde_json::to_vec(&self.payload)
            .map_err(|e| StreamError::WireFormat(format!("Control payload encode: {}", e)))?;
        if body.len() > MAX_CONTROL_PAYLOAD {
            return Err(StreamError::WireFormat(format!(
                "Control payload of {} bytes exceeds limit",
                body.len()
            )));
        }
        let mut buf = BytesMut::with_capacity(CONTROL_HEADER_SIZE + body.len());
        buf.put_u8(self.tag);
        buf.put_u32(body.len() as u32);
        buf.extend_from_slice(&body);
        Ok(buf.freeze())
    }

    /// Parse a message received from the data channel.
    pub fn decode(data: &[u8]) -> Result<ControlMessage> {
        if data.len() < CONTROL_HEADER_SIZE {
            return Err(StreamError::WireFormat(format!(
                "Control message too short: {} bytes",
                data.len()
            )));
        }
        let tag = data[0];
        let length = u32::from_be_bytes([data[1], data[2], data[3], data[4]]) as usize;
        if length > MAX_CONTROL_PAYLOAD {
            return Err(StreamError::WireFormat(format!(
                "Control payload length {} exceeds limit",
                length
            )));
        }
        let body = &data[CONTROL_HEADER_SIZE..];
        if body.len() != length {
            return Err(StreamError::WireFormat(format!(
                "Control payload length mismatch: header says {}, got {}",
                length,
                body.len()
            )));
        }
        let payload = serde_json::from_slice(body)
            .map_err(|e| StreamError::WireFormat(format!("Control payload decode: {}", e)))?;
        Ok(ControlMessage { tag, payload })
    }
}

/// Typed command decoded from an inbound control message.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    RequestKeyframe,
    SetBitrate { bitrate_kbps: u32 },
    SetResolution { width: u32, height: u32 },
    InputEvent { payload: serde_json::Value },
    SessionTerminate,
    Unknown { tag: u8 },
}

/// Telemetry report sent on the control channel on a fixed cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryReport {
    pub session_id: Uuid,
    /// Smoothed round-trip estimate, if one has been measured.
    pub rtt_ms: Option<u64>,
    pub frames_dropped: u64,
    pub fragments_sent: u64,
    pub fragments_dropped: u64,
    pub keyframes_sent: u64,
}

impl TelemetryReport {
    pub fn to_message(&self) -> Result<ControlMessage> {
        let payload = serde_json::to_value(self)
            .map_err(|e| StreamError::WireFormat(format!("Telemetry encode: {}", e)))?;
        Ok(ControlMessage::new(tags::TELEMETRY, payload))
    }
}

/// Decodes inbound control messages into commands and pushes outbound
/// control traffic with bounded retries.
#[derive(Clone)]
pub struct ControlRouter {
    retry_limit: u32,
}

impl ControlRouter {
    pub fn new(retry_limit: u32) -> Self {
        Self { retry_limit }
    }

    /// Map a tagged message to a command. Unknown tags and malformed
    /// payloads are ignored with a log, for forward compatibility.
    pub fn dispatch(&self, message: &ControlMessage) -> ControlCommand {
        match message.tag {
            tags::REQUEST_KEYFRAME => ControlCommand::RequestKeyframe,
            tags::SET_BITRATE => match message.payload.get("bitrate_kbps").and_then(|v| v.as_u64())
            {
                Some(kbps) if kbps > 0 && kbps <= u32::MAX as u64 => ControlCommand::SetBitrate {
                    bitrate_kbps: kbps as u32,
                },
                _ => {
                    log::warn!("Malformed set-bitrate payload: {}", message.payload);
                    ControlCommand::Unknown { tag: message.tag }
                }
            },
            tags::SET_RESOLUTION => {
                let width = message.payload.get("width").and_then(|v| v.as_u64());
                let height = message.payload.get("height").and_then(|v| v.as_u64());
                match (width, height) {
                    (Some(w), Some(h)) if w > 0 && h > 0 => ControlCommand::SetResolution {
                        width: w as u32,
                        height: h as u32,
                    },
                    _ => {
                        log::warn!("Malformed set-resolution payload: {}", message.payload);
                        ControlCommand::Unknown { tag: message.tag }
                    }
                }
            }
            tags::INPUT_EVENT => ControlCommand::InputEvent {
                payload: message.payload.clone(),
            },
            tags::SESSION_TERMINATE => ControlCommand::SessionTerminate,
            other => {
                log::debug!("Ignoring unknown control tag 0x{:02x}", other);
                ControlCommand::Unknown { tag: other }
            }
        }
    }

    /// Send a control message, retrying up to the bounded limit. A
    /// message that still fails is dropped with a log; control loss is
    /// never session-fatal.
    pub async fn send_with_retry(
        &self,
        session: &PeerSession,
        message: &ControlMessage,
    ) -> Result<()> {
        let mut last_err = None;
        for attempt in 0..=self.retry_limit {
            match session.send_control(message).await {
                Ok(()) => return Ok(()),
                Err(StreamError::SessionClosed) => return Err(StreamError::SessionClosed),
                Err(err) => {
                    log::warn!(
                        "Control send attempt {} failed for session {}: {}",
                        attempt + 1,
                        session.id(),
                        err
                    );
                    last_err = Some(err);
                }
            }
        }
        let reason = last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        log::warn!(
            "Dropping control message 0x{:02x} for session {} after {} attempts",
            message.tag,
            session.id(),
            self.retry_limit + 1
        );
        Err(StreamError::ControlDeliveryFailed(reason))
    }
}
