use crate::signals::{CellView, HostSignal};
use crate::views::{CellSnapshot, NotebookSnapshot};
use crate::CellId;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;
pub const CURRENT_PROTOCOL_VERSION: u16 = 1;

/// Accepted as `"1"`, `"v1"` or `1`; always written as a string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawVersion", into = "String")]
pub struct ProtocolVersion(pub u16);

impl ProtocolVersion {
    pub const CURRENT: Self = Self(CURRENT_PROTOCOL_VERSION);
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawVersion {
    Number(i64),
    Text(String),
}

impl TryFrom<RawVersion> for ProtocolVersion {
    type Error = String;

    fn try_from(raw: RawVersion) -> Result<Self, Self::Error> {
        match raw {
            RawVersion::Number(value) => u16::try_from(value)
                .map(ProtocolVersion)
                .map_err(|_| format!("protocol version out of range: {value}")),
            RawVersion::Text(text) => text
                .trim()
                .trim_start_matches('v')
                .parse::<u16>()
                .map(ProtocolVersion)
                .map_err(|err| format!("invalid protocol version '{text}': {err}")),
        }
    }
}

impl From<ProtocolVersion> for String {
    fn from(version: ProtocolVersion) -> Self {
        version.0.to_string()
    }
}

/// Frame exchanged between the hub and its kernel, host and subscriber
/// clients. One envelope per websocket text message or NDJSON line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireEnvelope {
    #[serde(default)]
    pub version: ProtocolVersion,
    pub notebook_id: String,
    pub sender_id: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub msg: WireMsg,
}

impl WireEnvelope {
    pub fn new(notebook_id: impl Into<String>, sender_id: impl Into<String>, msg: WireMsg) -> Self {
        Self {
            version: ProtocolVersion::CURRENT,
            notebook_id: notebook_id.into(),
            sender_id: sender_id.into(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            request_id: None,
            msg,
        }
    }

    /// Serializes the envelope as one websocket text message.
    pub fn to_text(&self) -> Result<String, FrameError> {
        serde_json::to_string(self).map_err(|err| FrameError::Encode(err.to_string()))
    }

    /// Parses one inbound frame. Validation is left to the caller so a
    /// rejection can still echo the frame's `request_id`.
    pub fn from_frame(bytes: &[u8], max_frame_bytes: usize) -> Result<Self, FrameError> {
        if bytes.len() > max_frame_bytes {
            return Err(FrameError::TooLarge {
                size: bytes.len(),
                max: max_frame_bytes,
            });
        }
        serde_json::from_slice(bytes).map_err(|err| FrameError::Invalid(err.to_string()))
    }

    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if self.notebook_id.trim().is_empty()
            || self.sender_id.trim().is_empty()
            || self.timestamp.trim().is_empty()
        {
            return Err(EnvelopeError::MissingRequiredFields);
        }
        if self.version != ProtocolVersion::CURRENT {
            return Err(EnvelopeError::UnsupportedVersion(self.version.0));
        }
        if chrono::DateTime::parse_from_rfc3339(&self.timestamp).is_err() {
            return Err(EnvelopeError::InvalidTimestamp(self.timestamp.clone()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    #[error("missing required envelope fields")]
    MissingRequiredFields,
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u16),
    #[error("invalid timestamp '{0}'")]
    InvalidTimestamp(String),
}

impl EnvelopeError {
    pub fn code(&self) -> &'static str {
        match self {
            EnvelopeError::MissingRequiredFields => "missing_required_fields",
            EnvelopeError::UnsupportedVersion(_) => "unsupported_version",
            EnvelopeError::InvalidTimestamp(_) => "invalid_timestamp",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum WireMsg {
    Hello(HelloPayload),
    /// Kernel comm data, forwarded untouched; decoding happens in the session.
    SparkEvent(Value),
    ActiveCell(ActiveCellPayload),
    CellExecutedAgain(CellExecutedAgainPayload),
    CellRemoved(CellRefPayload),
    CellRegistered(CellRefPayload),
    KernelRestarted,
    CellDisplay(CellDisplayPayload),
    ToggleAllDisplays,
    NotebookSnapshot(NotebookSnapshot),
    CellSnapshot(CellSnapshot),
    Error(ErrorPayload),
}

impl WireMsg {
    pub fn type_name(&self) -> &'static str {
        match self {
            WireMsg::Hello(_) => "hello",
            WireMsg::SparkEvent(_) => "spark_event",
            WireMsg::ActiveCell(_) => "active_cell",
            WireMsg::CellExecutedAgain(_) => "cell_executed_again",
            WireMsg::CellRemoved(_) => "cell_removed",
            WireMsg::CellRegistered(_) => "cell_registered",
            WireMsg::KernelRestarted => "kernel_restarted",
            WireMsg::CellDisplay(_) => "cell_display",
            WireMsg::ToggleAllDisplays => "toggle_all_displays",
            WireMsg::NotebookSnapshot(_) => "notebook_snapshot",
            WireMsg::CellSnapshot(_) => "cell_snapshot",
            WireMsg::Error(_) => "error",
        }
    }

    /// Host-originated messages map onto monitor signals; anything else is
    /// handed back unchanged.
    pub fn into_host_signal(self) -> Result<HostSignal, WireMsg> {
        match self {
            WireMsg::ActiveCell(payload) => Ok(HostSignal::ActiveCell {
                cell_id: payload.cell_id,
            }),
            WireMsg::CellExecutedAgain(payload) => Ok(HostSignal::CellExecutedAgain {
                cell_id: payload.cell_id,
                marker: payload.marker,
            }),
            WireMsg::CellRemoved(payload) => Ok(HostSignal::CellRemoved {
                cell_id: payload.cell_id,
            }),
            WireMsg::CellRegistered(payload) => Ok(HostSignal::CellRegistered {
                cell_id: payload.cell_id,
            }),
            WireMsg::KernelRestarted => Ok(HostSignal::KernelRestarted),
            WireMsg::CellDisplay(payload) => Ok(HostSignal::CellDisplay {
                cell_id: payload.cell_id,
                view: payload.view,
                collapsed: payload.collapsed,
                hidden: payload.hidden,
            }),
            WireMsg::ToggleAllDisplays => Ok(HostSignal::ToggleAllDisplays),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClientRole {
    /// Forwards engine listener events from the kernel.
    Kernel,
    /// Notebook frontend: supplies cell identity and lifecycle signals.
    Host,
    /// Display widgets: receive snapshots only.
    Subscriber,
}

impl ClientRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientRole::Kernel => "kernel",
            ClientRole::Host => "host",
            ClientRole::Subscriber => "subscriber",
        }
    }
}

impl fmt::Display for ClientRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HelloPayload {
    pub client_id: String,
    pub role: ClientRole,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActiveCellPayload {
    #[serde(default)]
    pub cell_id: Option<CellId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CellExecutedAgainPayload {
    pub cell_id: CellId,
    #[serde(default)]
    pub marker: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CellRefPayload {
    pub cell_id: CellId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CellDisplayPayload {
    pub cell_id: CellId,
    #[serde(default)]
    pub view: Option<CellView>,
    #[serde(default)]
    pub collapsed: Option<bool>,
    #[serde(default)]
    pub hidden: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame of {size} bytes exceeds limit of {max}")]
    TooLarge { size: usize, max: usize },
    #[error("invalid envelope: {0}")]
    Invalid(String),
    #[error("envelope encode failed: {0}")]
    Encode(String),
}

impl FrameError {
    /// Error code sent back to the client that produced the frame.
    pub fn code(&self) -> &'static str {
        match self {
            FrameError::TooLarge { .. } => "frame_too_large",
            FrameError::Invalid(_) => "invalid_payload",
            FrameError::Encode(_) => "encode_failed",
        }
    }
}

/// A recorded line that could not be parsed. Lines are numbered from 1.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {error}")]
pub struct LineError {
    pub line: usize,
    pub error: FrameError,
}

#[derive(Debug, Clone, Default)]
pub struct RecordedFrames {
    pub envelopes: Vec<WireEnvelope>,
    pub errors: Vec<LineError>,
}

/// Parses an NDJSON recording of hub traffic. Blank lines are skipped and a
/// bad line never stops the scan; the last line needs no trailing newline.
pub fn parse_envelope_lines(bytes: &[u8], max_frame_bytes: usize) -> RecordedFrames {
    let mut recorded = RecordedFrames::default();
    for (idx, line) in bytes.split(|byte| *byte == b'\n').enumerate() {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match WireEnvelope::from_frame(line, max_frame_bytes) {
            Ok(envelope) => recorded.envelopes.push(envelope),
            Err(error) => recorded.errors.push(LineError {
                line: idx + 1,
                error,
            }),
        }
    }
    recorded
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hello_envelope() -> WireEnvelope {
        WireEnvelope {
            version: ProtocolVersion::CURRENT,
            notebook_id: "nb-alpha".to_string(),
            sender_id: "kernel-1".to_string(),
            timestamp: "2026-02-07T21:00:00Z".to_string(),
            request_id: None,
            msg: WireMsg::Hello(HelloPayload {
                client_id: "kernel-1".to_string(),
                role: ClientRole::Kernel,
                capabilities: vec!["spark_event".to_string()],
            }),
        }
    }

    #[test]
    fn spark_event_payload_survives_framing() {
        let event = WireEnvelope {
            msg: WireMsg::SparkEvent(json!({
                "msgtype": "fromscala",
                "msg": "{\"msgtype\":\"sparkJobStart\",\"jobId\":1,\"submissionTime\":5}"
            })),
            ..hello_envelope()
        };
        let text = event.to_text().expect("encode");
        assert!(text.contains("\"version\":\"1\""));
        let decoded =
            WireEnvelope::from_frame(text.as_bytes(), DEFAULT_MAX_FRAME_BYTES).expect("decode");
        assert_eq!(decoded, event);
    }

    #[test]
    fn inbound_frames_map_to_client_error_codes() {
        let text = hello_envelope().to_text().expect("encode");
        let too_large = WireEnvelope::from_frame(text.as_bytes(), 16).expect_err("over limit");
        assert_eq!(too_large.code(), "frame_too_large");

        let invalid = WireEnvelope::from_frame(b"{\"type\":\"hello\"}", DEFAULT_MAX_FRAME_BYTES)
            .expect_err("missing fields");
        assert_eq!(invalid.code(), "invalid_payload");
    }

    #[test]
    fn unit_messages_need_no_payload() {
        let parsed: WireEnvelope = serde_json::from_value(json!({
            "version": "1",
            "type": "kernel_restarted",
            "notebook_id": "nb-alpha",
            "sender_id": "host-1",
            "timestamp": "2026-02-07T21:00:00Z"
        }))
        .expect("parse unit message");
        assert_eq!(parsed.msg, WireMsg::KernelRestarted);
        assert_eq!(
            parsed.msg.into_host_signal(),
            Ok(HostSignal::KernelRestarted)
        );
    }

    #[test]
    fn host_messages_convert_to_signals_and_others_do_not() {
        let msg = WireMsg::CellExecutedAgain(CellExecutedAgainPayload {
            cell_id: CellId::new("c1"),
            marker: Some("display-7".to_string()),
        });
        assert_eq!(
            msg.into_host_signal(),
            Ok(HostSignal::CellExecutedAgain {
                cell_id: CellId::new("c1"),
                marker: Some("display-7".to_string()),
            })
        );

        let hello = hello_envelope().msg;
        assert!(matches!(hello.into_host_signal(), Err(WireMsg::Hello(_))));
    }

    #[test]
    fn recording_scan_reports_bad_lines_and_keeps_going() {
        let first = hello_envelope().to_text().expect("encode first");
        let last = WireEnvelope {
            msg: WireMsg::ToggleAllDisplays,
            ..hello_envelope()
        }
        .to_text()
        .expect("encode last");
        let oversized = format!("{{\"blob\":\"{}\"}}", "x".repeat(2_000));
        let recording = format!("{first}\r\n{{\"not\":\"valid\"\n   \n{oversized}\n{last}");

        let recorded = parse_envelope_lines(recording.as_bytes(), 1_024);
        assert_eq!(recorded.envelopes.len(), 2);
        assert_eq!(recorded.envelopes[1].msg, WireMsg::ToggleAllDisplays);
        let lines: Vec<usize> = recorded.errors.iter().map(|err| err.line).collect();
        assert_eq!(lines, vec![2, 4]);
        assert!(matches!(recorded.errors[0].error, FrameError::Invalid(_)));
        assert!(matches!(
            recorded.errors[1].error,
            FrameError::TooLarge { .. }
        ));
    }

    #[test]
    fn validate_rejects_bad_timestamp_and_version() {
        assert_eq!(hello_envelope().validate(), Ok(()));

        let stale = WireEnvelope {
            version: ProtocolVersion(2),
            ..hello_envelope()
        };
        assert_eq!(stale.validate(), Err(EnvelopeError::UnsupportedVersion(2)));

        let bad_time = WireEnvelope {
            timestamp: "yesterday".to_string(),
            ..hello_envelope()
        };
        assert_eq!(
            bad_time.validate().map_err(|err| err.code()),
            Err("invalid_timestamp")
        );

        let fresh = WireEnvelope::new("nb", "hub", WireMsg::ToggleAllDisplays);
        assert_eq!(fresh.validate(), Ok(()));
    }

    #[test]
    fn version_field_accepts_string_number_and_missing() {
        let numeric: WireEnvelope = serde_json::from_value(json!({
            "version": 1,
            "type": "hello",
            "notebook_id": "nb-alpha",
            "sender_id": "client-a",
            "timestamp": "2026-02-07T21:00:00Z",
            "payload": {"client_id": "client-a", "role": "subscriber"}
        }))
        .expect("parse numeric version");
        assert_eq!(numeric.version, ProtocolVersion(1));

        let missing: WireEnvelope = serde_json::from_value(json!({
            "type": "hello",
            "notebook_id": "nb-alpha",
            "sender_id": "client-a",
            "timestamp": "2026-02-07T21:00:00Z",
            "payload": {"client_id": "client-a", "role": "subscriber"}
        }))
        .expect("parse missing version");
        assert_eq!(missing.version, ProtocolVersion::CURRENT);

        let prefixed: ProtocolVersion = serde_json::from_value(json!("v1")).expect("prefixed");
        assert_eq!(prefixed, ProtocolVersion(1));
        assert!(serde_json::from_value::<ProtocolVersion>(json!(-1)).is_err());
        assert!(serde_json::from_value::<ProtocolVersion>(json!("one")).is_err());
    }
}
