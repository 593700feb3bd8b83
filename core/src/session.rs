use serde::{Deserialize, Serialize};

/// Request/response type constants exchanged with the session manager.
pub mod request_type {
    pub const REQUEST_CONNECT: &str = "REQUEST_CONNECT";
    pub const REQUEST_DISCONNECT: &str = "REQUEST_DISCONNECT";
    pub const SESSION_INITIATED: &str = "SESSION_INITIATED";
    pub const SESSION_CLOSED: &str = "SESSION_CLOSED";
    pub const RESPONSE_ALREADY_CONNECTED: &str = "RESPONSE_ALREADY_CONNECTED";
    pub const RESPONSE_NOT_VALID_OPERATION: &str = "RESPONSE_NOT_VALID_OPERATION";
    pub const RESPONSE_UNKNOWN_SESSION: &str = "RESPONSE_UNKNOWN_SESSION";
}

/// Payload that tells a client receiver to stop.
pub const STOP_SENTINEL: &str = "STOP_FLAG";

/// Control message exchanged between clients and the session manager service.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionMessage {
    pub request_type: String,
    pub session_id: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl SessionMessage {
    pub fn new(request_type: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            request_type: request_type.into(),
            session_id: session_id.into(),
            ..Default::default()
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(s: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    /// Replies the session manager uses to refuse a connect.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self.request_type.as_str(),
            request_type::RESPONSE_ALREADY_CONNECTED
                | request_type::RESPONSE_NOT_VALID_OPERATION
                | request_type::RESPONSE_UNKNOWN_SESSION
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_uses_camel_case_keys() {
        let msg = SessionMessage::new(request_type::REQUEST_CONNECT, "client-1")
            .with_url("127.0.0.1:5556");
        let json = msg.to_json().unwrap();
        assert!(json.contains("\"requestType\":\"REQUEST_CONNECT\""));
        assert!(json.contains("\"sessionId\":\"client-1\""));
        assert_eq!(SessionMessage::from_json(&json).unwrap(), msg);
    }

    #[test]
    fn rejections() {
        assert!(SessionMessage::new(request_type::RESPONSE_UNKNOWN_SESSION, "s").is_rejection());
        assert!(!SessionMessage::new(request_type::SESSION_INITIATED, "s").is_rejection());
    }
}
