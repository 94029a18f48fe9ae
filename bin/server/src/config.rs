//! Centralized server configuration.
//!
//! This module provides strongly-typed configuration for the server,
//! loaded via the `config` crate from environment variables. Nested keys use
//! `__` as the separator, e.g. `PROVIDER__MODEL=gpt-4o-mini` or
//! `AGENT__MAX_TURNS=6`.
//!
//! See [`AgentConfig`](tally_ai::AgentConfig) and
//! [`ProviderConfig`](tally_ai::ProviderConfig) for the library settings.

use serde::Deserialize;
use std::path::PathBuf;
use tally_ai::{AgentConfig, ProviderConfig};
use tally_conversation::MediaConfig;

/// Server configuration composed from library configs.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// PostgreSQL database connection URL.
    pub database_url: String,

    /// Address the HTTP listener binds to.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Maximum number of pooled database connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Orchestration settings.
    #[serde(default)]
    pub agent: AgentConfig,

    /// Generation provider settings.
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Media archiving settings.
    #[serde(default)]
    pub media: MediaSettings,
}

/// Media archiving configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MediaSettings {
    /// Deployment environment, used as the first segment of object names.
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Directory archived media is written to.
    #[serde(default = "default_media_root")]
    pub root: PathBuf,
}

fn default_bind_address() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_environment() -> String {
    "dev".to_string()
}

fn default_media_root() -> PathBuf {
    PathBuf::from("media")
}

impl Default for MediaSettings {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            root: default_media_root(),
        }
    }
}

impl MediaSettings {
    /// Returns the archiver configuration.
    #[must_use]
    pub fn archiver_config(&self) -> MediaConfig {
        MediaConfig {
            environment: self.environment.clone(),
        }
    }
}

impl ServerConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required configuration is missing or invalid.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_settings_have_correct_defaults() {
        let media = MediaSettings::default();
        assert_eq!(media.environment, "dev");
        assert_eq!(media.root, PathBuf::from("media"));
        assert_eq!(media.archiver_config().environment, "dev");
    }

    #[test]
    fn only_database_url_is_required() {
        let config: ServerConfig = config::Config::builder()
            .set_override("database_url", "postgres://localhost/tally")
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.bind_address, "127.0.0.1:3000");
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.agent.max_turns, 8);
        assert!(config.provider.api_key.is_none());
    }

    #[test]
    fn nested_overrides_are_applied() {
        let config: ServerConfig = config::Config::builder()
            .set_override("database_url", "postgres://localhost/tally")
            .unwrap()
            .set_override("agent.max_turns", 3)
            .unwrap()
            .set_override("media.environment", "prod")
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.agent.max_turns, 3);
        assert_eq!(config.media.environment, "prod");
    }
}
