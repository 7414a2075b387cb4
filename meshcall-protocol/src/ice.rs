use serde::{Deserialize, Serialize};

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// A single STUN or TURN server used for ICE.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }

    pub fn is_turn(&self) -> bool {
        self.urls
            .iter()
            .any(|url| url.starts_with("turn:") || url.starts_with("turns:"))
    }
}

/// ICE servers handed to every peer connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceConfig {
    pub servers: Vec<IceServer>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            servers: vec![IceServer::stun(DEFAULT_STUN_SERVER)],
        }
    }
}

impl IceConfig {
    /// TURN servers are operator-supplied, there are none by default.
    pub fn has_turn(&self) -> bool {
        self.servers.iter().any(IceServer::is_turn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_has_public_stun_only() {
        let config = IceConfig::default();
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.servers[0].urls, vec![DEFAULT_STUN_SERVER.to_string()]);
        assert!(!config.has_turn());
    }

    #[test]
    fn deserialize_turn_server() {
        let config: IceConfig = serde_json::from_str(
            r#"{"servers":[{"urls":["turn:turn.example.org:3478"],"username":"u","credential":"c"}]}"#,
        )
        .unwrap();
        assert_eq!(
            config.servers[0],
            IceServer::turn("turn:turn.example.org:3478", "u", "c")
        );
        assert!(config.has_turn());
    }
}
