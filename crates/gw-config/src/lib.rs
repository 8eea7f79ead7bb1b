//! Gatewire configuration.
//!
//! TOML-based configuration with environment variable overrides. Every knob
//! has a default, so an empty file (or no file) yields a working gateway.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub messages: MessagesConfig,
    pub session: SessionConfig,
    pub workers: WorkersConfig,
    pub dispatch: DispatchConfig,

    /// State directory holding the lifecycle database and the legacy
    /// file queue.
    pub state_dir: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            messages: MessagesConfig::default(),
            session: SessionConfig::default(),
            workers: WorkersConfig::default(),
            dispatch: DispatchConfig::default(),
            state_dir: "./state".to_string(),
        }
    }
}

impl AppConfig {
    /// Load from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers.outbox_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "workers.outbox_interval_ms must be > 0".to_string(),
            ));
        }
        if self.workers.turn_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "workers.turn_interval_ms must be > 0".to_string(),
            ));
        }
        if self.workers.max_turns_per_pass == 0 {
            return Err(ConfigError::ValidationError(
                "workers.max_turns_per_pass must be > 0".to_string(),
            ));
        }
        if self.messages.delivery.max_age_ms == 0 {
            return Err(ConfigError::ValidationError(
                "messages.delivery.max_age_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagesConfig {
    pub delivery: DeliveryConfig,
}

/// Outbox delivery window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// How long a queued delivery may wait before it is considered stale.
    pub max_age_ms: i64,
    /// What to do with a stale row: mark it expired, or attempt one final
    /// delivery before giving up.
    pub expire_action: ExpireAction,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_age_ms: 30 * 60 * 1000,
            expire_action: ExpireAction::Fail,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpireAction {
    #[default]
    Fail,
    Deliver,
}

impl ExpireAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "fail" => Some(ExpireAction::Fail),
            "deliver" => Some(ExpireAction::Deliver),
            _ => None,
        }
    }
}

/// Session entry storage. The template may contain `{agentId}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub store: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            store: "./state/sessions/{agentId}".to_string(),
        }
    }
}

impl SessionConfig {
    pub fn store_for_agent(&self, agent_id: &str) -> String {
        self.store.replace("{agentId}", agent_id)
    }
}

/// Background worker cadences.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub outbox_interval_ms: u64,
    pub turn_interval_ms: u64,
    pub max_turns_per_pass: u32,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            outbox_interval_ms: 1000,
            turn_interval_ms: 1200,
            max_turns_per_pass: 16,
        }
    }
}

/// Dispatch driver policy knobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// When true, a turn whose final replies all queued but none confirmed
    /// still finalizes as delivered. The default leaves such turns to the
    /// recovery workers.
    pub finalize_unconfirmed_sends: bool,
}
