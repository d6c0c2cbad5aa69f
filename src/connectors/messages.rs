// src/connectors/messages.rs
use serde::{Deserialize, Serialize};

/// Text frames exchanged as heartbeats. The broadcaster answers our `ping`
/// with a bare `pong`; neither reaches the decoder.
pub const PING_FRAME: &str = "ping";
pub const PONG_FRAME: &str = "pong";

pub const AUTH_OK: &str = "AUTH_OK";
pub const AUTH_REJECTED: &str = "AUTH_REJECTED";

/// First frame sent after the socket opens. The broadcaster accepts traffic
/// only after acknowledging it.
#[derive(Debug, Serialize)]
pub struct AuthRequest<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub secret: &'a str,
    pub client_id: &'a str,
}

impl<'a> AuthRequest<'a> {
    pub fn new(secret: &'a str, client_id: &'a str) -> Self {
        Self {
            kind: "AUTH",
            secret,
            client_id,
        }
    }
}

/// Broadcaster's answer to an `AuthRequest`.
#[derive(Debug, Deserialize)]
pub struct AuthReply {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_request_serializes_with_wire_type() {
        let frame = serde_json::to_string(&AuthRequest::new("s3cret", "agent-1")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "AUTH");
        assert_eq!(value["secret"], "s3cret");
        assert_eq!(value["client_id"], "agent-1");
    }

    #[test]
    fn auth_reply_reason_is_optional() {
        let ok: AuthReply = serde_json::from_str(r#"{"type":"AUTH_OK"}"#).unwrap();
        assert_eq!(ok.kind, AUTH_OK);
        assert!(ok.reason.is_none());

        let rejected: AuthReply =
            serde_json::from_str(r#"{"type":"AUTH_REJECTED","reason":"bad secret"}"#).unwrap();
        assert_eq!(rejected.kind, AUTH_REJECTED);
        assert_eq!(rejected.reason.as_deref(), Some("bad secret"));
    }
}
