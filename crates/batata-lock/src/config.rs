//! Configuration loading
//!
//! Settings are layered the usual way: an optional config file, then
//! environment variables prefixed with `BATATA_` using `__` between path
//! segments (`BATATA_LOCK__TTL_MS=30000` sets `lock.ttl_ms`).

use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::manager::{DEFAULT_ATTEMPT_TIMEOUT, LockOptions, default_owner_id};
use crate::retry::RetryPolicy;

pub const ENV_PREFIX: &str = "BATATA";
pub const LOCK_SECTION: &str = "lock";

/// The `[lock]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockConfig {
    /// Owner identity; defaults to `<hostname>-<uuid>`
    #[serde(default)]
    pub owner_id: Option<String>,
    /// Lease length in milliseconds (None = no lease)
    #[serde(default)]
    pub ttl_ms: Option<u64>,
    /// Deadline for each store call in milliseconds
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_attempt_timeout_ms() -> u64 {
    DEFAULT_ATTEMPT_TIMEOUT.as_millis() as u64
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            owner_id: None,
            ttl_ms: None,
            attempt_timeout_ms: default_attempt_timeout_ms(),
            retry: RetryPolicy::default(),
        }
    }
}

impl LockConfig {
    /// Load the `[lock]` section from `path` (if given) and the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        load_section(path, LOCK_SECTION)
    }

    pub fn to_options(&self) -> LockOptions {
        LockOptions {
            owner_id: self.owner_id.clone().unwrap_or_else(default_owner_id),
            ttl: self.ttl_ms.map(Duration::from_millis),
            attempt_timeout: Duration::from_millis(self.attempt_timeout_ms),
        }
    }
}

/// Environment source used by [`load_section`]
pub fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

/// Deserialize one top-level section, falling back to its defaults when absent
pub fn load_section<T>(path: Option<&Path>, section: &str) -> Result<T, ConfigError>
where
    T: DeserializeOwned + Default,
{
    load_section_with(path, section, environment())
}

pub fn load_section_with<T>(
    path: Option<&Path>,
    section: &str,
    env: Environment,
) -> Result<T, ConfigError>
where
    T: DeserializeOwned + Default,
{
    let mut builder = Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(File::from(path));
    }
    let settings = builder.add_source(env).build()?;

    match settings.get::<T>(section) {
        Ok(value) => Ok(value),
        Err(ConfigError::NotFound(_)) => Ok(T::default()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;
    use crate::retry::Backoff;

    fn no_env() -> Environment {
        environment().source(Some(HashMap::new()))
    }

    #[test]
    fn test_defaults_without_sources() {
        let config: LockConfig = load_section_with(None, LOCK_SECTION, no_env()).unwrap();
        assert_eq!(config, LockConfig::default());

        let options = config.to_options();
        assert_eq!(options.attempt_timeout, Duration::from_secs(5));
        assert!(options.ttl.is_none());
        assert!(!options.owner_id.is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[lock]
owner_id = "worker-1"
ttl_ms = 15000
attempt_timeout_ms = 2000

[lock.retry]
max_attempts = 10
jitter = 0.0

[lock.retry.backoff]
kind = "fixed"
delay_ms = 1000
"#
        )
        .unwrap();

        let config: LockConfig =
            load_section_with(Some(file.path()), LOCK_SECTION, no_env()).unwrap();
        assert_eq!(config.owner_id.as_deref(), Some("worker-1"));
        assert_eq!(config.ttl_ms, Some(15000));
        assert_eq!(config.retry.max_attempts, Some(10));
        assert_eq!(config.retry.backoff, Backoff::Fixed { delay_ms: 1000 });

        let options = config.to_options();
        assert_eq!(options.owner_id, "worker-1");
        assert_eq!(options.ttl, Some(Duration::from_secs(15)));
        assert_eq!(options.attempt_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_environment_overrides_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[lock]\nttl_ms = 15000").unwrap();

        let env = environment().source(Some(HashMap::from([
            ("BATATA_LOCK__TTL_MS".to_string(), "45000".to_string()),
            ("BATATA_LOCK__OWNER_ID".to_string(), "from-env".to_string()),
        ])));
        let config: LockConfig = load_section_with(Some(file.path()), LOCK_SECTION, env).unwrap();
        assert_eq!(config.ttl_ms, Some(45000));
        assert_eq!(config.owner_id.as_deref(), Some("from-env"));
    }

    #[test]
    fn test_missing_file_is_error() {
        let result: Result<LockConfig, _> = load_section_with(
            Some(Path::new("/nonexistent/batata-lock.toml")),
            LOCK_SECTION,
            no_env(),
        );
        assert!(result.is_err());
    }
}
