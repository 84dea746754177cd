use std::env;

use anyhow::{Context, Result};
use dotenvy::dotenv;

use crate::error::StoreError;

/// Default bound on actions listeners may dispatch within one drain.
pub const DEFAULT_MAX_QUEUE_DEPTH: usize = 1024;

/// Default number of transitions kept in the transition log.
pub const DEFAULT_HISTORY_LIMIT: usize = 256;

/// Store configuration.
///
/// Built with [`StoreConfig::default`] and the `with_*` setters, or loaded
/// from the environment with [`StoreConfig::from_env`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Name used in log fields.
    pub name: String,
    /// Maximum number of actions one drain accepts from its own listeners,
    /// counting the one that started it. Exceeding it is a dispatch loop.
    /// Callers on other threads wait instead and are not counted.
    pub max_queue_depth: usize,
    /// Transitions retained by the transition log (0 disables it).
    pub history_limit: usize,
    /// Convert reducer and listener panics into errors instead of unwinding
    /// through `dispatch`.
    pub catch_panics: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: "store".to_string(),
            max_queue_depth: DEFAULT_MAX_QUEUE_DEPTH,
            history_limit: DEFAULT_HISTORY_LIMIT,
            catch_panics: true,
        }
    }
}

impl StoreConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let defaults = Self::default();
        let config = Self {
            name: env::var("STATEHUB_NAME").unwrap_or(defaults.name),
            max_queue_depth: match env::var("STATEHUB_MAX_QUEUE_DEPTH") {
                Ok(raw) => raw
                    .parse()
                    .context("STATEHUB_MAX_QUEUE_DEPTH must be a valid number")?,
                Err(_) => defaults.max_queue_depth,
            },
            history_limit: match env::var("STATEHUB_HISTORY_LIMIT") {
                Ok(raw) => raw
                    .parse()
                    .context("STATEHUB_HISTORY_LIMIT must be a valid number")?,
                Err(_) => defaults.history_limit,
            },
            catch_panics: match env::var("STATEHUB_CATCH_PANICS") {
                Ok(raw) => parse_flag(&raw)
                    .context("STATEHUB_CATCH_PANICS must be true or false")?,
                Err(_) => defaults.catch_panics,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Set the store name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the dispatch queue bound.
    pub fn with_max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = depth;
        self
    }

    /// Set the transition log size.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Choose whether panics are caught.
    pub fn with_catch_panics(mut self, catch_panics: bool) -> Self {
        self.catch_panics = catch_panics;
        self
    }

    /// Reject configurations the store cannot run with.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.max_queue_depth == 0 {
            return Err(StoreError::Config(
                "max_queue_depth must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_flag(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("unrecognized flag value '{}'", other),
    }
}
