// Конфигурация приложения
// Логирование можно отключить только в режиме разработки

use crate::error::{Result, SignalingError};
use crate::peer::types::ServerConfig;
use crate::utils::add_ice_url_scheme;
use serde::{Deserialize, Serialize};
use std::path::Path;
use webrtc::ice_transport::ice_server::RTCIceServer;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true; // В режиме отладки логирование включено

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false; // В продакшене логирование отключено

// Дополнительные настройки для режима разработки
#[cfg(debug_assertions)]
pub mod dev {
    // Для полного отключения логирования в режиме разработки
    // измените эту константу на false
    // ВАЖНО: Эта настройка работает только в debug режиме!
    pub const ENABLE_LOGGING: bool = true;
}

#[cfg(not(debug_assertions))]
pub mod dev {
    pub const ENABLE_LOGGING: bool = false;
}

pub const STORE_URL_ENV: &str = "RENDEZVOUS_STORE_URL";
pub const STORE_KEY_ENV: &str = "RENDEZVOUS_STORE_KEY";

const DEFAULT_TABLE: &str = "calls";
const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Полная конфигурация сигнального слоя
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SignalingConfig {
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<ServerConfig>,
    #[serde(default)]
    pub store: StoreConfig,
}

/// Где лежат записи звонков
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoreConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            store: StoreConfig::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_key: None,
            table: default_table(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_table() -> String {
    DEFAULT_TABLE.to_string()
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

/// STUN от Google и публичные TURN openrelay (только для тестов, в проде свой TURN)
pub fn default_ice_servers() -> Vec<ServerConfig> {
    let turn = |id: &str, url: &str| ServerConfig {
        id: id.into(),
        r#type: "turn".into(),
        url: url.into(),
        username: Some("openrelayproject".into()),
        credential: Some("openrelayproject".into()),
    };

    vec![
        ServerConfig {
            id: "default-stun".into(),
            r#type: "stun".into(),
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        turn("openrelay-80", "turn:openrelay.metered.ca:80"),
        turn("openrelay-443", "turn:openrelay.metered.ca:443"),
        turn("openrelay-443-tcp", "turn:openrelay.metered.ca:443?transport=tcp"),
    ]
}

impl SignalingConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let mut config: SignalingConfig = toml::from_str(s)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Переменные окружения перекрывают файл, если они не пустые
    pub fn apply_env_overrides(&mut self) {
        if let Some(url) = non_empty_env(STORE_URL_ENV) {
            self.store.url = url;
        }
        if let Some(key) = non_empty_env(STORE_KEY_ENV) {
            self.store.api_key = Some(key);
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_ice_servers(&self.ice_servers)?;
        if self.store.poll_interval_ms == 0 {
            return Err(SignalingError::Config(
                "store poll interval must be positive".into(),
            ));
        }
        Ok(())
    }

    /// ICE серверы в формате webrtc
    pub fn rtc_ice_servers(&self) -> Vec<RTCIceServer> {
        get_user_ice_servers(&self.ice_servers)
    }
}

pub fn validate_ice_servers(servers: &[ServerConfig]) -> Result<()> {
    for server in servers {
        if server.url.trim().is_empty() {
            return Err(SignalingError::Config(format!(
                "ICE server {} has an empty URL",
                server.id
            )));
        }

        if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none()) {
            return Err(SignalingError::Config(format!(
                "TURN server {} requires username and credential",
                server.id
            )));
        }
    }
    Ok(())
}

pub fn get_user_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_gives_defaults() {
        let config: SignalingConfig = toml::from_str("").unwrap();
        assert_eq!(config.ice_servers, default_ice_servers());
        assert_eq!(config.store.table, "calls");
        assert_eq!(config.store.poll_interval_ms, 500);
    }

    #[test]
    fn parses_custom_servers_and_store() {
        let config: SignalingConfig = toml::from_str(
            r#"
            [[ice_servers]]
            id = "lan"
            type = "stun"
            url = "192.168.1.1:3478"

            [store]
            url = "https://db.example.org"
            api_key = "anon"
            poll_interval_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.store.url, "https://db.example.org");
        assert_eq!(config.store.api_key.as_deref(), Some("anon"));
        assert_eq!(config.store.table, "calls");

        let rtc = config.rtc_ice_servers();
        assert_eq!(rtc[0].urls, vec!["stun:192.168.1.1:3478".to_string()]);
        assert!(rtc[0].username.is_empty());
    }

    #[test]
    fn turn_without_credentials_rejected() {
        let err = SignalingConfig::from_toml_str(
            r#"
            [[ice_servers]]
            id = "relay"
            type = "turn"
            url = "turn:relay.example.org:3478"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, SignalingError::Config(_)));
    }

    #[test]
    fn zero_poll_interval_rejected() {
        let err = SignalingConfig::from_toml_str("[store]\npoll_interval_ms = 0\n").unwrap_err();
        assert!(matches!(err, SignalingError::Config(_)));
    }

    #[test]
    fn default_servers_are_valid() {
        assert!(SignalingConfig::default().validate().is_ok());
        let rtc = SignalingConfig::default().rtc_ice_servers();
        assert_eq!(rtc.len(), 4);
        assert_eq!(rtc[1].username, "openrelayproject");
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[store]\ntable = \"rooms\"").unwrap();
        let config = SignalingConfig::load(file.path()).unwrap();
        assert_eq!(config.store.table, "rooms");
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = SignalingConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, SignalingError::Config(_)));
    }
}
