//! JSON WebSocket protocol between browser clients and the broker.
//!
//! All application traffic is JSON text with a `type` discriminator, except
//! shell output which is forwarded to the client as raw binary frames.
//! The client-to-server set is closed: `auth`, `data`, `resize`. Anything
//! else fails to decode and closes the connection with a protocol error.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Client → server frames.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    /// First frame on every connection: credentials plus an optional resume
    /// hint and environment overrides for a newly created session.
    #[serde(rename_all = "camelCase")]
    Auth {
        #[serde(default)]
        api_key: Option<String>,
        #[serde(default)]
        access_token: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        environment_variables: Option<HashMap<String, String>>,
    },

    /// UTF-8 bytes for the shell's stdin. `\x03` is ^C; the PTY line
    /// discipline turns it into SIGINT inside the sandbox.
    Data { payload: String },

    /// TTY window size change.
    Resize { cols: u16, rows: u16 },
}

impl ClientFrame {
    /// Decode a text frame. Unknown `type` values and malformed JSON are
    /// both protocol errors.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Connection lifecycle states reported to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// Server → client status frame.
///
/// Shell output does not use this type; it is forwarded verbatim as binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusFrame {
    #[serde(rename = "type")]
    pub kind: StatusKind,
    pub payload: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// The only server-side frame type; a unit enum keeps the tag literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Status,
}

impl StatusFrame {
    pub fn new(payload: Status) -> Self {
        Self {
            kind: StatusKind::Status,
            payload,
            reason: None,
            details: None,
        }
    }

    pub fn with_reason(payload: Status, reason: &str) -> Self {
        Self {
            kind: StatusKind::Status,
            payload,
            reason: Some(reason.to_string()),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn to_json(&self) -> String {
        // StatusFrame contains only serializable leaves; this cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{\"type\":\"status\"}"))
    }
}

/// Close reasons used in `status` frames before the socket is closed.
/// This is the complete set; clients switch on these strings.
pub mod reason {
    pub const AUTH_TIMEOUT: &str = "auth_timeout";
    pub const AUTH_FAILED: &str = "auth_failed";
    pub const PROTOCOL_ERROR: &str = "protocol_error";
    pub const MESSAGE_TOO_LARGE: &str = "message_too_large";
    pub const CAPACITY: &str = "capacity";
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const RESUME_NOT_FOUND: &str = "resume_not_found";
    pub const RESUME_MISMATCH: &str = "resume_mismatch";
    pub const RESUME_EXPIRED: &str = "resume_expired";
    pub const RESUME_RATE_LIMITED: &str = "resume_rate_limited";
    pub const RESUME_CONFLICT: &str = "resume_conflict";
    pub const CONTAINER_CREATE_FAILED: &str = "container_create_failed";
    pub const CONTAINER_ATTACH_FAILED: &str = "container_attach_failed";
    pub const CONTAINER_GONE: &str = "container_gone";
    pub const TIMEOUT: &str = "timeout";
    pub const EXITED: &str = "exited";
    pub const REPLACED: &str = "replaced";
    pub const SHUTDOWN: &str = "shutdown";
}

/// Maximum number of environment overrides accepted at session creation.
pub const MAX_ENVIRONMENT_VARIABLES: usize = 32;

/// Maximum byte length of a single environment value.
pub const MAX_ENVIRONMENT_VALUE_LEN: usize = 1024;

/// Validate client-supplied environment overrides.
///
/// Keys must look like shell identifiers; the count and value sizes are
/// bounded so a client cannot bloat the container command line.
pub fn validate_environment(env: &HashMap<String, String>) -> Result<(), String> {
    if env.len() > MAX_ENVIRONMENT_VARIABLES {
        return Err(format!(
            "too many environment variables ({} > {MAX_ENVIRONMENT_VARIABLES})",
            env.len()
        ));
    }
    for (key, value) in env {
        let mut chars = key.chars();
        let head_ok = chars
            .next()
            .map(|c| c.is_ascii_alphabetic() || c == '_')
            .unwrap_or(false);
        if !head_ok || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(format!("invalid environment variable name {key:?}"));
        }
        if value.len() > MAX_ENVIRONMENT_VALUE_LEN {
            return Err(format!(
                "environment variable {key:?} value too long ({} > {MAX_ENVIRONMENT_VALUE_LEN})",
                value.len()
            ));
        }
    }
    Ok(())
}

/// Clamp a client-supplied terminal dimension to a sane range.
pub fn clamp_dimension(value: u16) -> u16 {
    value.clamp(1, 500)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_auth_frame_full() {
        let frame = ClientFrame::parse(
            r#"{"type":"auth","apiKey":"app.k:s","accessToken":"tok","sessionId":"abc","environmentVariables":{"FOO":"bar"}}"#,
        )
        .unwrap();
        match frame {
            ClientFrame::Auth {
                api_key,
                access_token,
                session_id,
                environment_variables,
            } => {
                assert_eq!(api_key.as_deref(), Some("app.k:s"));
                assert_eq!(access_token.as_deref(), Some("tok"));
                assert_eq!(session_id.as_deref(), Some("abc"));
                assert_eq!(
                    environment_variables.unwrap().get("FOO").map(String::as_str),
                    Some("bar")
                );
            }
            other => panic!("expected Auth, got {other:?}"),
        }
    }

    #[test]
    fn parse_auth_frame_minimal() {
        let frame = ClientFrame::parse(r#"{"type":"auth"}"#).unwrap();
        match frame {
            ClientFrame::Auth {
                api_key,
                access_token,
                session_id,
                environment_variables,
            } => {
                assert!(api_key.is_none());
                assert!(access_token.is_none());
                assert!(session_id.is_none());
                assert!(environment_variables.is_none());
            }
            other => panic!("expected Auth, got {other:?}"),
        }
    }

    #[test]
    fn parse_data_frame() {
        let frame = ClientFrame::parse(r#"{"type":"data","payload":"echo hi\n"}"#).unwrap();
        match frame {
            ClientFrame::Data { payload } => assert_eq!(payload, "echo hi\n"),
            other => panic!("expected Data, got {other:?}"),
        }
    }

    #[test]
    fn parse_resize_frame() {
        let frame = ClientFrame::parse(r#"{"type":"resize","cols":120,"rows":40}"#).unwrap();
        match frame {
            ClientFrame::Resize { cols, rows } => {
                assert_eq!(cols, 120);
                assert_eq!(rows, 40);
            }
            other => panic!("expected Resize, got {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(ClientFrame::parse(r#"{"type":"ping"}"#).is_err());
    }

    #[test]
    fn missing_type_is_rejected() {
        assert!(ClientFrame::parse(r#"{"payload":"hi"}"#).is_err());
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(ClientFrame::parse("{nope").is_err());
    }

    #[test]
    fn status_frame_serializes_with_type_tag() {
        let json = StatusFrame::new(Status::Connecting).to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "status");
        assert_eq!(value["payload"], "connecting");
        assert!(value.get("reason").is_none());
        assert!(value.get("details").is_none());
    }

    #[test]
    fn status_frame_with_reason_and_details() {
        let json = StatusFrame::with_reason(Status::Error, reason::AUTH_FAILED)
            .with_details(serde_json::json!({"hint": "token"}))
            .to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["payload"], "error");
        assert_eq!(value["reason"], "auth_failed");
        assert_eq!(value["details"]["hint"], "token");
    }

    #[test]
    fn status_frame_round_trips() {
        let frame = StatusFrame::with_reason(Status::Disconnected, reason::REPLACED);
        let decoded: StatusFrame = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(decoded.payload, Status::Disconnected);
        assert_eq!(decoded.reason.as_deref(), Some("replaced"));
    }

    #[test]
    fn environment_validation_accepts_sane_input() {
        let mut env = HashMap::new();
        env.insert("PATH_EXTRA".to_string(), "/opt/bin".to_string());
        env.insert("_UNDERSCORE".to_string(), "ok".to_string());
        assert!(validate_environment(&env).is_ok());
    }

    #[test]
    fn environment_validation_rejects_bad_names() {
        for bad in ["1LEADING", "has-dash", "has space", ""] {
            let mut env = HashMap::new();
            env.insert(bad.to_string(), "v".to_string());
            assert!(validate_environment(&env).is_err(), "expected rejection of {bad:?}");
        }
    }

    #[test]
    fn environment_validation_rejects_too_many() {
        let env: HashMap<String, String> = (0..MAX_ENVIRONMENT_VARIABLES + 1)
            .map(|i| (format!("VAR_{i}"), "v".to_string()))
            .collect();
        assert!(validate_environment(&env).is_err());
    }

    #[test]
    fn environment_validation_rejects_oversized_value() {
        let mut env = HashMap::new();
        env.insert("BIG".to_string(), "x".repeat(MAX_ENVIRONMENT_VALUE_LEN + 1));
        assert!(validate_environment(&env).is_err());
    }

    #[test]
    fn dimensions_are_clamped() {
        assert_eq!(clamp_dimension(0), 1);
        assert_eq!(clamp_dimension(80), 80);
        assert_eq!(clamp_dimension(9999), 500);
    }
}
