//! Wire message definitions for the terminal gateway.
//!
//! Every frame on the connection is a UTF-8 JSON object whose `type` field
//! selects the variant. Each variant carries exactly the fields it needs:
//!
//! ```text
//! {"type":"input","data":"ls\n"}
//! {"type":"output","data":"..."}
//! {"type":"resize","cols":120,"rows":40}
//! {"type":"heartbeat","ts":1717171717000}
//! {"type":"error","message":"..."}
//! ```

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{ProtocolError, Result};

/// All `type` tags defined by the protocol.
pub const MESSAGE_TYPES: &[&str] = &["input", "output", "resize", "heartbeat", "error"];

/// A single message exchanged between client and gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WireMessage {
    /// Keystrokes or pasted text for the shell (client to gateway).
    Input { data: String },
    /// Shell output (gateway to client).
    Output { data: String },
    /// Terminal geometry change (client to gateway).
    Resize {
        #[serde(deserialize_with = "dimension")]
        cols: u16,
        #[serde(deserialize_with = "dimension")]
        rows: u16,
    },
    /// Liveness signal, sent by both sides. `ts` is milliseconds since the
    /// Unix epoch when present.
    Heartbeat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ts: Option<i64>,
    },
    /// A recoverable error report, or the final message before a close.
    Error { message: String },
}

impl WireMessage {
    /// Creates an `input` message.
    pub fn input(data: impl Into<String>) -> Self {
        WireMessage::Input { data: data.into() }
    }

    /// Creates an `output` message.
    pub fn output(data: impl Into<String>) -> Self {
        WireMessage::Output { data: data.into() }
    }

    /// Creates a `resize` message.
    pub fn resize(cols: u16, rows: u16) -> Self {
        WireMessage::Resize { cols, rows }
    }

    /// Creates a `heartbeat` message stamped with the current wall-clock time.
    pub fn heartbeat_now() -> Self {
        WireMessage::Heartbeat {
            ts: Some(unix_millis()),
        }
    }

    /// Creates an `error` message.
    pub fn error(message: impl Into<String>) -> Self {
        WireMessage::Error {
            message: message.into(),
        }
    }

    /// Returns the `type` tag of this message.
    pub fn message_type(&self) -> &'static str {
        match self {
            WireMessage::Input { .. } => "input",
            WireMessage::Output { .. } => "output",
            WireMessage::Resize { .. } => "resize",
            WireMessage::Heartbeat { .. } => "heartbeat",
            WireMessage::Error { .. } => "error",
        }
    }

    /// Serializes the message to its JSON text form.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Decodes a JSON text frame.
    ///
    /// A known `type` with missing or mistyped fields is `Malformed`; a
    /// well-formed object with an undefined `type` is `UnknownType`. Neither
    /// case falls back to a default message.
    pub fn decode(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;

        match value.get("type") {
            Some(Value::String(kind)) if MESSAGE_TYPES.contains(&kind.as_str()) => {}
            Some(Value::String(kind)) => return Err(ProtocolError::UnknownType(kind.clone())),
            Some(other) => {
                return Err(ProtocolError::Malformed(format!(
                    "`type` must be a string, got {}",
                    other
                )))
            }
            None => return Err(ProtocolError::Malformed("missing `type` field".to_string())),
        }

        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Accepts any JSON number as a terminal dimension. Fractions are truncated;
/// values outside `u16` become 0, which is below every resize floor.
fn dimension<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    if value.is_finite() && (0.0..=f64::from(u16::MAX)).contains(&value) {
        Ok(value as u16)
    } else {
        Ok(0)
    }
}

/// Milliseconds since the Unix epoch, saturating at zero for clocks set
/// before 1970.
pub fn unix_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_input() {
        let json = WireMessage::input("ls -la\n").to_json().unwrap();
        assert_eq!(json, r#"{"type":"input","data":"ls -la\n"}"#);
    }

    #[test]
    fn test_encode_resize() {
        let json = WireMessage::resize(120, 40).to_json().unwrap();
        assert_eq!(json, r#"{"type":"resize","cols":120,"rows":40}"#);
    }

    #[test]
    fn test_encode_heartbeat_without_ts_omits_field() {
        let json = WireMessage::Heartbeat { ts: None }.to_json().unwrap();
        assert_eq!(json, r#"{"type":"heartbeat"}"#);
    }

    #[test]
    fn test_heartbeat_now_carries_timestamp() {
        match WireMessage::heartbeat_now() {
            WireMessage::Heartbeat { ts: Some(ts) } => assert!(ts > 0),
            other => panic!("expected stamped heartbeat, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_heartbeat_with_and_without_ts() {
        assert_eq!(
            WireMessage::decode(r#"{"type":"heartbeat"}"#).unwrap(),
            WireMessage::Heartbeat { ts: None }
        );
        assert_eq!(
            WireMessage::decode(r#"{"type":"heartbeat","ts":1700000000000}"#).unwrap(),
            WireMessage::Heartbeat {
                ts: Some(1_700_000_000_000)
            }
        );
    }

    #[test]
    fn test_decode_error_message() {
        let msg = WireMessage::decode(r#"{"type":"error","message":"Process exited with code 0"}"#)
            .unwrap();
        assert_eq!(msg, WireMessage::error("Process exited with code 0"));
    }

    #[test]
    fn test_decode_unknown_type() {
        let err = WireMessage::decode(r#"{"type":"paste","data":"x"}"#).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownType("paste".to_string()));
        assert_eq!(err.to_string(), "Unknown message type: paste");
    }

    #[test]
    fn test_decode_missing_type_is_malformed() {
        let err = WireMessage::decode(r#"{"data":"x"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_decode_non_string_type_is_malformed() {
        let err = WireMessage::decode(r#"{"type":7}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_decode_invalid_json_is_malformed() {
        let err = WireMessage::decode("not json at all").unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_decode_resize_missing_field_is_malformed() {
        let err = WireMessage::decode(r#"{"type":"resize","cols":80}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_decode_resize_wrong_field_type_is_malformed() {
        let err = WireMessage::decode(r#"{"type":"resize","cols":"80","rows":24}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));

        let err = WireMessage::decode(r#"{"type":"resize","cols":null,"rows":24}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_decode_resize_out_of_range_numbers_fall_below_floor() {
        assert_eq!(
            WireMessage::decode(r#"{"type":"resize","cols":-1,"rows":5}"#).unwrap(),
            WireMessage::resize(0, 5)
        );
        assert_eq!(
            WireMessage::decode(r#"{"type":"resize","cols":100,"rows":70000}"#).unwrap(),
            WireMessage::resize(100, 0)
        );
        assert_eq!(
            WireMessage::decode(r#"{"type":"resize","cols":120.7,"rows":40.2}"#).unwrap(),
            WireMessage::resize(120, 40)
        );
    }

    #[test]
    fn test_decode_input_without_data_is_malformed() {
        let err = WireMessage::decode(r#"{"type":"input"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_message_type_tags_match_wire_names() {
        let messages = [
            WireMessage::input("a"),
            WireMessage::output("b"),
            WireMessage::resize(80, 24),
            WireMessage::Heartbeat { ts: None },
            WireMessage::error("c"),
        ];
        for msg in messages {
            let json: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
            assert_eq!(json["type"], msg.message_type());
            assert!(MESSAGE_TYPES.contains(&msg.message_type()));
        }
    }
}
