//! Admission Packets
//!
//! The first frame on a fresh connection is an [`AuthPacket`]; the server answers
//! with an [`AuthResult`] before any endpoint traffic is dispatched.

use serde::{Deserialize, Serialize};

/// Only supported admission protocol version
pub const AUTH_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPacket {
    pub auth_version: u32,
    pub client_identifier: String,
    pub client_passkey: String,
}

impl AuthPacket {
    pub fn new(client_identifier: impl Into<String>, client_passkey: impl Into<String>) -> Self {
        Self {
            auth_version: AUTH_VERSION,
            client_identifier: client_identifier.into(),
            client_passkey: client_passkey.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuthResult {
    pub fn accepted() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_auth_packet_wire_shape() {
        let packet = AuthPacket::new("app-1", "secret");
        assert_eq!(
            serde_json::to_value(&packet).unwrap(),
            json!({ "authVersion": 1, "clientIdentifier": "app-1", "clientPasskey": "secret" })
        );
    }
}
