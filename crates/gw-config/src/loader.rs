//! Configuration loader with file and environment variable support.

use crate::{AppConfig, ConfigError, ExpireAction};
use std::env;
use std::path::PathBuf;
use tracing::{info, warn};

/// Standard config file search paths, checked in order.
const CONFIG_PATHS: &[&str] = &[
    "gatewire.toml",
    "config.toml",
    "./config/gatewire.toml",
    "/etc/gatewire/config.toml",
];

pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with env overrides applied
    /// on top.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);
        config.validate()?;

        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("GATEWIRE_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    fn apply_env_overrides(&self, config: &mut AppConfig) {
        if let Ok(dir) = env::var("GATEWIRE_STATE_DIR") {
            config.state_dir = dir;
        }
        if let Ok(store) = env::var("GATEWIRE_SESSION_STORE") {
            config.session.store = store;
        }
        if let Some(ms) = env_parse::<i64>("GATEWIRE_DELIVERY_MAX_AGE_MS") {
            config.messages.delivery.max_age_ms = ms;
        }
        if let Ok(action) = env::var("GATEWIRE_DELIVERY_EXPIRE_ACTION") {
            match ExpireAction::parse(&action) {
                Some(parsed) => config.messages.delivery.expire_action = parsed,
                None => warn!(value = %action, "Unknown expire action, keeping configured value"),
            }
        }
        if let Some(ms) = env_parse::<u64>("GATEWIRE_OUTBOX_INTERVAL_MS") {
            config.workers.outbox_interval_ms = ms;
        }
        if let Some(ms) = env_parse::<u64>("GATEWIRE_TURN_INTERVAL_MS") {
            config.workers.turn_interval_ms = ms;
        }
        if let Some(n) = env_parse::<u32>("GATEWIRE_MAX_TURNS_PER_PASS") {
            config.workers.max_turns_per_pass = n;
        }
        if let Some(v) = env_parse::<bool>("GATEWIRE_FINALIZE_UNCONFIRMED_SENDS") {
            config.dispatch.finalize_unconfirmed_sends = v;
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}
