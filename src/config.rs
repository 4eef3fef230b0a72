// Конфигурация сессии и логирования

use crate::error::ConfigError;
use crate::utils::turn_rest_credentials;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true; // В режиме отладки логирование включено

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false; // В продакшене логирование отключено

/// Период замера качества канала по умолчанию.
pub const DEFAULT_SAMPLING_INTERVAL_MS: u64 = 1000;

/// Конфигурация ICE сервера
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IceServerConfig {
    pub id: String,
    pub r#type: String, // 'stun' или 'turn'
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

/// Формат текста локального дескриптора для ручной передачи.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DescriptorFormat {
    /// Конверт с id сессии, gzip + base64. Достаточно короткий, чтобы вставить куда угодно.
    #[default]
    Compact,
    /// «Голый» JSON `{"type", "sdp"}`, как его отдаёт браузер.
    Json,
}

/// Общий секрет TURN сервера (`static-auth-secret` в coturn).
///
/// TURN серверы без своих учётных данных получают временные, выпущенные из него.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TurnSecret {
    pub secret: String,
    #[serde(default = "default_turn_user")]
    pub user: String,
    #[serde(default = "default_turn_ttl")]
    pub ttl_secs: u64,
}

fn default_turn_user() -> String {
    "webuser".into()
}

fn default_turn_ttl() -> u64 {
    3600
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    pub ice_servers: Vec<IceServerConfig>,
    pub sampling_interval_ms: u64,
    pub descriptor_format: DescriptorFormat,
    /// `None`: замеряет только зритель.
    pub sample_link_health: Option<bool>,
    pub turn_secret: Option<TurnSecret>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            sampling_interval_ms: DEFAULT_SAMPLING_INTERVAL_MS,
            descriptor_format: DescriptorFormat::default(),
            sample_link_health: None,
            turn_secret: None,
        }
    }
}

impl SessionConfig {
    pub fn from_json(s: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(ConfigError::EmptyUrl(server.id.clone()));
            }
            if needs_credentials(server) && self.turn_secret.is_none() {
                return Err(ConfigError::MissingTurnCredentials(server.id.clone()));
            }
        }
        if let Some(turn) = &self.turn_secret {
            if turn.secret.is_empty() {
                return Err(ConfigError::EmptyTurnSecret);
            }
        }
        if self.sampling_interval_ms == 0 {
            return Err(ConfigError::ZeroSamplingInterval);
        }
        Ok(())
    }

    pub fn sampling_interval(&self) -> Duration {
        Duration::from_millis(self.sampling_interval_ms)
    }

    /// ICE серверы для peer connection. TURN без учётных данных получают
    /// временные, действующие `ttl_secs` от `now` (unix-время в секундах).
    pub fn resolved_ice_servers(&self, now: i64) -> Result<Vec<IceServerConfig>, ConfigError> {
        let mut servers = self.ice_servers.clone();
        let Some(turn) = &self.turn_secret else {
            return Ok(servers);
        };

        let expiry = now.saturating_add(turn.ttl_secs as i64);
        for server in servers.iter_mut().filter(|s| needs_credentials(s)) {
            let (username, credential) = turn_rest_credentials(&turn.secret, &turn.user, expiry)?;
            server.username = Some(username);
            server.credential = Some(credential);
        }
        Ok(servers)
    }
}

fn needs_credentials(server: &IceServerConfig) -> bool {
    server.r#type == "turn" && (server.username.is_none() || server.credential.is_none())
}

/// Дефолтные STUN серверы
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![
        IceServerConfig {
            id: "default-stun".into(),
            r#type: "stun".into(),
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        IceServerConfig {
            id: "default-stun-1".into(),
            r#type: "stun".into(),
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SessionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sampling_interval(), Duration::from_secs(1));
        assert_eq!(config.ice_servers.len(), 2);
    }

    #[test]
    fn turn_without_credentials_is_rejected() {
        let json = r#"{
            "ice_servers": [
                { "id": "relay", "type": "turn", "url": "turn.example.org:3478" }
            ]
        }"#;
        let err = SessionConfig::from_json(json).unwrap_err();
        assert!(matches!(err, ConfigError::MissingTurnCredentials(id) if id == "relay"));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = SessionConfig::from_json(r#"{ "descriptor_format": "json" }"#).unwrap();
        assert_eq!(config.descriptor_format, DescriptorFormat::Json);
        assert_eq!(config.sampling_interval_ms, DEFAULT_SAMPLING_INTERVAL_MS);
        assert_eq!(config.ice_servers, default_ice_servers());
    }

    #[test]
    fn turn_secret_mints_missing_credentials() {
        let json = r#"{
            "ice_servers": [
                { "id": "relay", "type": "turn", "url": "turn.example.org:3478?transport=udp" },
                { "id": "static", "type": "turn", "url": "turn.example.org:3478",
                  "username": "alice", "credential": "pw" },
                { "id": "stun", "type": "stun", "url": "stun.example.org:3478" }
            ],
            "turn_secret": { "secret": "SUPER_LONG_RANDOM_SECRET_KEY" }
        }"#;
        let config = SessionConfig::from_json(json).unwrap();
        let turn = config.turn_secret.as_ref().unwrap();
        assert_eq!(turn.user, "webuser");
        assert_eq!(turn.ttl_secs, 3600);

        let servers = config.resolved_ice_servers(1_700_000_000).unwrap();
        assert_eq!(servers[0].username.as_deref(), Some("1700003600:webuser"));
        assert_eq!(
            servers[0].credential.as_deref(),
            Some("9EGYxv17apas/OsykHd2IftvDI0=")
        );
        assert_eq!(servers[1].username.as_deref(), Some("alice"));
        assert_eq!(servers[2].username, None);
    }

    #[test]
    fn without_secret_servers_pass_through() {
        let config = SessionConfig::default();
        assert_eq!(config.resolved_ice_servers(0).unwrap(), config.ice_servers);
    }

    #[test]
    fn empty_turn_secret_is_rejected() {
        let err = SessionConfig::from_json(r#"{ "turn_secret": { "secret": "" } }"#).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyTurnSecret));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let err = SessionConfig::from_json(r#"{ "sampling_interval_ms": 0 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::ZeroSamplingInterval));
    }
}
