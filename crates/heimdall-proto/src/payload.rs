//! Typed handshake payloads.
//!
//! These are the only payloads the client needs to understand. Everything
//! else on the gateway is carried through as an opaque value.

use serde::{Deserialize, Serialize};

/// Dispatch event type that completes an identify.
pub const READY: &str = "READY";

/// Dispatch event type that completes a resume.
pub const RESUMED: &str = "RESUMED";

/// Client properties reported in IDENTIFY.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionProperties {
    /// Operating system.
    #[serde(rename = "$os")]
    pub os: String,
    /// Client library name.
    #[serde(rename = "$browser")]
    pub browser: String,
    /// Device name.
    #[serde(rename = "$device")]
    pub device: String,
}

impl Default for ConnectionProperties {
    fn default() -> Self {
        let library = format!("Heimdall/{}", env!("CARGO_PKG_VERSION"));
        Self {
            os: std::env::consts::OS.to_string(),
            browser: library.clone(),
            device: library,
        }
    }
}

/// IDENTIFY request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyPayload {
    /// Authentication token.
    pub token: String,
    /// Client properties.
    pub properties: ConnectionProperties,
    /// Ask the server to compress individual payloads.
    pub compress: bool,
    /// Member count above which a guild is considered large.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub large_threshold: Option<u32>,
    /// `[index, count]`.
    pub shard: [u32; 2],
    /// Whether presence and typing events should be sent for guilds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guild_subscriptions: Option<bool>,
    /// Gateway intents bitfield.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intents: Option<u64>,
}

/// RESUME request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePayload {
    /// Authentication token.
    pub token: String,
    /// Session being resumed.
    pub session_id: String,
    /// Last sequence number received.
    pub seq: Option<u64>,
}

/// HELLO body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloPayload {
    /// Heartbeat interval in milliseconds.
    pub heartbeat_interval: u64,
    /// Servers that handled the connection, for debugging.
    #[serde(default, rename = "_trace", skip_serializing_if = "Option::is_none")]
    pub trace: Option<Vec<String>>,
}

/// The parts of the READY dispatch the client keeps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyPayload {
    /// Session id to resume with later.
    pub session_id: String,
    /// Gateway protocol version.
    #[serde(default, rename = "v")]
    pub version: Option<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identify_serialization() {
        let identify = IdentifyPayload {
            token: "secret".to_string(),
            properties: ConnectionProperties {
                os: "linux".to_string(),
                browser: "Heimdall/0.1.0".to_string(),
                device: "Heimdall/0.1.0".to_string(),
            },
            compress: true,
            large_threshold: None,
            shard: [1, 4],
            guild_subscriptions: Some(false),
            intents: None,
        };

        let value = serde_json::to_value(&identify).expect("serialize");
        assert_eq!(
            value,
            json!({
                "token": "secret",
                "properties": {
                    "$os": "linux",
                    "$browser": "Heimdall/0.1.0",
                    "$device": "Heimdall/0.1.0"
                },
                "compress": true,
                "shard": [1, 4],
                "guild_subscriptions": false
            })
        );
    }

    #[test]
    fn test_default_properties_name_library() {
        let props = ConnectionProperties::default();
        assert!(props.browser.starts_with("Heimdall/"));
        assert_eq!(props.browser, props.device);
    }

    #[test]
    fn test_hello_with_trace() {
        let hello: HelloPayload = serde_json::from_value(json!({
            "heartbeat_interval": 41250,
            "_trace": ["gateway-prd-1"]
        }))
        .expect("deserialize");
        assert_eq!(hello.heartbeat_interval, 41250);
        assert_eq!(hello.trace, Some(vec!["gateway-prd-1".to_string()]));
    }

    #[test]
    fn test_ready_ignores_extra_fields() {
        let ready: ReadyPayload = serde_json::from_value(json!({
            "v": 6,
            "session_id": "abc",
            "user": {"id": "1"},
            "guilds": []
        }))
        .expect("deserialize");
        assert_eq!(ready.session_id, "abc");
        assert_eq!(ready.version, Some(6));
    }

    #[test]
    fn test_resume_null_sequence() {
        let resume = ResumePayload {
            token: "t".to_string(),
            session_id: "s".to_string(),
            seq: None,
        };
        let value = serde_json::to_value(&resume).expect("serialize");
        assert_eq!(value, json!({"token": "t", "session_id": "s", "seq": null}));
    }
}
