use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Environment variable that overrides `chat.password`.
pub const PASSWORD_ENV: &str = "COLLAB_CHAT_PASSWORD";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    pub chat: ChatConfig,

    #[serde(default)]
    pub session: SessionConfig,
}

/// Where and as whom to chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatConfig {
    /// XMPP-over-WebSocket endpoint, e.g. `wss://chat.example.org/xmpp-websocket`
    pub endpoint: String,

    /// Full room address, or a bare room name resolved against the user's domain
    pub room: String,

    pub jid: String,

    #[serde(default)]
    pub password: String,

    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// File backing the session store; the platform cache dir when unset.
    pub store_path: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_timeout_seconds() -> u64 {
    30
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Replace the password with `COLLAB_CHAT_PASSWORD` when it is set.
    pub fn apply_env(&mut self) {
        if let Ok(password) = std::env::var(PASSWORD_ENV) {
            if !password.is_empty() {
                self.chat.password = password;
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let chat = &self.chat;
        if chat.endpoint.trim().is_empty() {
            return Err(ConfigError::Invalid("chat.endpoint is empty".to_string()));
        }
        if !(chat.endpoint.starts_with("ws://") || chat.endpoint.starts_with("wss://")) {
            return Err(ConfigError::Invalid(format!(
                "chat.endpoint must be a ws:// or wss:// URL, got {}",
                chat.endpoint
            )));
        }
        if chat.room.trim().is_empty() {
            return Err(ConfigError::Invalid("chat.room is empty".to_string()));
        }
        match chat.jid.split_once('@') {
            Some((node, domain)) if !node.is_empty() && !domain.is_empty() => {}
            _ => {
                return Err(ConfigError::Invalid(format!(
                    "chat.jid must look like user@domain, got {:?}",
                    chat.jid
                )));
            }
        }
        if chat.timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "chat.timeout_seconds must be positive".to_string(),
            ));
        }
        Ok(())
    }

    #[cfg(feature = "native")]
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        Ok(project_dirs()?.config_dir().join("config.toml"))
    }

    /// Session store file: configured path or `session.json` in the cache dir.
    #[cfg(feature = "native")]
    pub fn store_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.session.store_path {
            Some(path) => Ok(path.clone()),
            None => Ok(project_dirs()?.cache_dir().join("session.json")),
        }
    }
}

#[cfg(feature = "native")]
fn project_dirs() -> Result<directories::ProjectDirs, ConfigError> {
    directories::ProjectDirs::from("org", "collab", "collab-chat").ok_or(ConfigError::NoConfigDir)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    const SAMPLE: &str = r#"
log_level = "debug"

[chat]
endpoint = "wss://chat.example.org/xmpp-websocket"
room = "lobby"
jid = "alice@example.org"
password = "secret"
"#;

    #[test]
    fn parses_sample_config() {
        let config = Config::from_toml(SAMPLE).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.chat.room, "lobby");
        assert_eq!(config.chat.jid, "alice@example.org");
        assert_eq!(config.chat.timeout_seconds, 30);
        assert_eq!(config.session, SessionConfig::default());
        config.validate().unwrap();
    }

    #[test]
    fn log_level_defaults_to_info() {
        let config = Config::from_toml(
            r#"
[chat]
endpoint = "ws://localhost:5280/ws"
room = "dev@conference.localhost"
jid = "bob@localhost"
"#,
        )
        .unwrap();
        assert_eq!(config.log_level, "info");
        assert!(config.chat.password.is_empty());
    }

    #[test]
    fn missing_chat_table_is_a_parse_error() {
        assert_matches!(
            Config::from_toml("log_level = \"info\""),
            Err(ConfigError::Parse(_))
        );
    }

    #[test]
    fn validate_rejects_bad_values() {
        let base = Config::from_toml(SAMPLE).unwrap();

        let mut config = base.clone();
        config.chat.jid = "alice".to_string();
        assert_matches!(config.validate(), Err(ConfigError::Invalid(_)));

        let mut config = base.clone();
        config.chat.endpoint = "https://chat.example.org/http-bind".to_string();
        assert_matches!(config.validate(), Err(ConfigError::Invalid(_)));

        let mut config = base.clone();
        config.chat.room = "  ".to_string();
        assert_matches!(config.validate(), Err(ConfigError::Invalid(_)));

        let mut config = base;
        config.chat.timeout_seconds = 0;
        assert_matches!(config.validate(), Err(ConfigError::Invalid(_)));
    }

    #[test]
    fn load_reports_missing_file_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("absent.toml");
        match Config::load(&path) {
            Err(ConfigError::Io { path: reported, .. }) => assert_eq!(reported, path),
            other => panic!("expected Io error, got {other:?}"),
        }
    }

    #[test]
    fn load_reads_file_from_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.chat.endpoint, "wss://chat.example.org/xmpp-websocket");
    }

    #[cfg(feature = "native")]
    #[test]
    fn explicit_store_path_wins() {
        let mut config = Config::from_toml(SAMPLE).unwrap();
        config.session.store_path = Some(PathBuf::from("/tmp/collab-session.json"));
        assert_eq!(
            config.store_path().unwrap(),
            PathBuf::from("/tmp/collab-session.json")
        );
    }
}
