//! Environment configuration.

use ormcache_core::{ConfigError, Error, IsolationLevel, Result};
use serde::{Deserialize, Serialize};

/// Number of attempts a unit of work gets when the database keeps
/// reporting serialization failures.
pub const DB_SERIALIZATION_MAX_RETRIES: u32 = 5;

/// Arbitrary metadata carried by an environment (language, timezone, ...).
pub type Context = serde_json::Map<String, serde_json::Value>;

/// Settings for environments opened by the transaction runners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Isolation level of every transaction
    pub isolation: IsolationLevel,
    /// Total attempts before a serialization failure is surfaced
    pub max_attempts: u32,
    /// Id of the acting user
    pub uid: i64,
    /// Initial context of every environment
    pub context: Context,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            isolation: IsolationLevel::Serializable,
            max_attempts: DB_SERIALIZATION_MAX_RETRIES,
            uid: 0,
            context: Context::new(),
        }
    }
}

impl EnvironmentConfig {
    /// Create a configuration for the given user.
    pub fn new(uid: i64) -> Self {
        Self {
            uid,
            ..Default::default()
        }
    }

    /// Parse a JSON document; missing keys keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config(ConfigError {
                message: "max_attempts must be at least 1".to_string(),
                source: None,
            }));
        }
        Ok(())
    }

    /// Set the isolation level.
    pub fn isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    /// Set the attempt ceiling.
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    /// Set the acting user.
    pub fn uid(mut self, uid: i64) -> Self {
        self.uid = uid;
        self
    }

    /// Add a context entry.
    pub fn context_value(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }
}
