//! Bot configuration, read from `config.toml` with environment overrides.

use std::env;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

const DEFAULT_CONFIG_PATH: &str = "config.toml";
const CONFIG_PATH_VAR: &str = "JUKEBOT_CONFIG";
const TOKEN_VAR: &str = "DISCORD_TOKEN";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub prefix: String,
    pub token: Option<String>,
    pub logging: LoggingConfig,
    pub player: PlayerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is not set.
    pub level: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Upper bound for metadata lookup, voice connection and stream opening.
    pub timeout_secs: u64,
    /// Stream failures in a row before a guild session is torn down.
    pub max_consecutive_failures: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            prefix: "!".to_string(),
            token: None,
            logging: LoggingConfig::default(),
            player: PlayerConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig { level: "info".to_string() }
    }
}

impl Default for PlayerConfig {
    fn default() -> Self {
        PlayerConfig {
            timeout_secs: 30,
            max_consecutive_failures: 5,
        }
    }
}

impl PlayerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Reads the config file (if any) and applies `DISCORD_TOKEN`.
    pub fn load() -> Result<Config, ConfigError> {
        let path = env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        let content = match std::fs::read_to_string(&path) {
            Ok(content) => Some(content),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => None,
            Err(source) => return Err(ConfigError::Io { path, source }),
        };

        let config = match content {
            Some(content) => Config::parse(&content, &path)?,
            None => Config::default(),
        };

        config.with_env_token(env::var(TOKEN_VAR).ok())
    }

    fn parse(content: &str, path: &str) -> Result<Config, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// The environment token wins over the file; a blank token counts as missing.
    fn with_env_token(mut self, env_token: Option<String>) -> Result<Config, ConfigError> {
        if let Some(token) = env_token.filter(|t| !t.trim().is_empty()) {
            self.token = Some(token);
        }

        match &self.token {
            Some(token) if !token.trim().is_empty() => Ok(self),
            _ => Err(ConfigError::MissingToken),
        }
    }

    /// Only valid after [`Config::load`], which guarantees a token.
    pub fn token(&self) -> &str {
        self.token.as_deref().unwrap_or_default()
    }
}
