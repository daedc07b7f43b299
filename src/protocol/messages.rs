//! Wire messages

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Message kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Auth,
    Ping,
    Pong,
    AuthSuccess,
    /// Anything this client does not understand
    #[default]
    #[serde(other)]
    Unknown,
}

/// Frame received from the server
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub action: Action,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub result: Value,
}

impl InboundMessage {
    /// `result.token` of an `AUTH_SUCCESS` message
    pub fn token(&self) -> Option<&str> {
        self.result.get("token").and_then(Value::as_str)
    }
}

/// Frame sent to the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_action: Option<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<AuthResult>,
}

impl OutboundMessage {
    /// Client-initiated heartbeat with a fresh id
    pub fn ping(version: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            version: Some(version.to_string()),
            action: Some(Action::Ping),
            origin_action: None,
            data: Some(Value::Object(Default::default())),
            result: None,
        }
    }

    /// Acknowledgement of a `PING` or `PONG`
    pub fn pong(id: &str) -> Self {
        Self {
            id: id.to_string(),
            version: None,
            action: None,
            origin_action: Some(Action::Pong),
            data: None,
            result: None,
        }
    }

    /// Reply to an `AUTH` request
    pub fn auth(id: &str, result: AuthResult) -> Self {
        Self {
            id: id.to_string(),
            version: None,
            action: None,
            origin_action: Some(Action::Auth),
            data: None,
            result: Some(result),
        }
    }
}

/// Payload of an `AUTH` reply.
///
/// Either `browser_id` is set, or `token` and `device_id` are. Use the
/// constructors to keep the two shapes apart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub user_id: String,
    pub user_agent: String,
    pub timestamp: i64,
    pub device_type: String,
    pub version: String,
    pub extension_id: String,
}

impl AuthResult {
    /// Identity-only authentication
    pub fn with_browser_id(
        profile: &ClientProfile,
        user_id: &str,
        device_id: &str,
        timestamp: i64,
    ) -> Self {
        Self {
            browser_id: Some(device_id.to_string()),
            device_id: None,
            token: None,
            ..Self::base(profile, user_id, timestamp)
        }
    }

    /// Authentication with a cached session token
    pub fn with_token(
        profile: &ClientProfile,
        user_id: &str,
        device_id: &str,
        token: &str,
        timestamp: i64,
    ) -> Self {
        Self {
            browser_id: None,
            device_id: Some(device_id.to_string()),
            token: Some(token.to_string()),
            ..Self::base(profile, user_id, timestamp)
        }
    }

    fn base(profile: &ClientProfile, user_id: &str, timestamp: i64) -> Self {
        Self {
            browser_id: None,
            device_id: None,
            token: None,
            user_id: user_id.to_string(),
            user_agent: profile.user_agent.clone(),
            timestamp,
            device_type: profile.device_type.clone(),
            version: profile.version.clone(),
            extension_id: profile.extension_id.clone(),
        }
    }
}

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";
pub const DEFAULT_DEVICE_TYPE: &str = "extension";
pub const DEFAULT_CLIENT_VERSION: &str = "4.20.2";
pub const DEFAULT_EXTENSION_ID: &str = "lkbnfiajjmbhnfledhphioinpickokdi";

/// How this client presents itself to the service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientProfile {
    pub user_agent: String,
    pub device_type: String,
    pub version: String,
    pub extension_id: String,
}

impl Default for ClientProfile {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            device_type: DEFAULT_DEVICE_TYPE.to_string(),
            version: DEFAULT_CLIENT_VERSION.to_string(),
            extension_id: DEFAULT_EXTENSION_ID.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_auth_request() {
        let msg: InboundMessage =
            serde_json::from_str(r#"{"id":"a1","action":"AUTH","data":{}}"#).unwrap();
        assert_eq!(msg.id, "a1");
        assert_eq!(msg.action, Action::Auth);
    }

    #[test]
    fn test_parse_auth_success_token() {
        let msg: InboundMessage = serde_json::from_str(
            r#"{"id":"s1","action":"AUTH_SUCCESS","result":{"token":"tok-9"}}"#,
        )
        .unwrap();
        assert_eq!(msg.action, Action::AuthSuccess);
        assert_eq!(msg.token(), Some("tok-9"));
    }

    #[test]
    fn test_unknown_action_parses() {
        let msg: InboundMessage =
            serde_json::from_str(r#"{"id":"x","action":"HTTP_REQUEST","data":{"url":"u"}}"#)
                .unwrap();
        assert_eq!(msg.action, Action::Unknown);
    }

    #[test]
    fn test_ping_shape() {
        let ping = OutboundMessage::ping("1.0.0");
        let value = serde_json::to_value(&ping).unwrap();

        assert_eq!(value["action"], "PING");
        assert_eq!(value["version"], "1.0.0");
        assert_eq!(value["data"], json!({}));
        assert!(Uuid::parse_str(value["id"].as_str().unwrap()).is_ok());
        assert!(value.get("origin_action").is_none());
    }

    #[test]
    fn test_pong_shape() {
        let value = serde_json::to_value(OutboundMessage::pong("p7")).unwrap();
        assert_eq!(value, json!({"id": "p7", "origin_action": "PONG"}));
    }

    #[test]
    fn test_auth_result_shapes_are_exclusive() {
        let profile = ClientProfile::default();

        let plain = serde_json::to_value(AuthResult::with_browser_id(&profile, "u1", "d1", 10)).unwrap();
        assert_eq!(plain["browser_id"], "d1");
        assert!(plain.get("token").is_none());
        assert!(plain.get("device_id").is_none());
        assert_eq!(plain["device_type"], "extension");

        let tokened =
            serde_json::to_value(AuthResult::with_token(&profile, "u1", "d1", "tok", 10)).unwrap();
        assert_eq!(tokened["token"], "tok");
        assert_eq!(tokened["device_id"], "d1");
        assert!(tokened.get("browser_id").is_none());
    }
}
