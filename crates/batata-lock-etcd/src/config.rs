//! Configuration for the etcd store

use std::path::Path;
use std::time::Duration;

use batata_lock::config::{environment, load_section_with};
use config::ConfigError;
use serde::{Deserialize, Serialize};

pub const ETCD_SECTION: &str = "etcd";

/// Connection settings for an etcd cluster
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EtcdConfig {
    /// Gateway endpoints, tried in order
    pub endpoints: Vec<String>,
    /// Connection timeout in milliseconds
    pub dial_timeout_ms: u64,
    /// Per-request timeout in milliseconds
    pub request_timeout_ms: u64,
    /// Username; authentication is skipped when empty
    pub username: String,
    pub password: String,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://localhost:2379".to_string()],
            dial_timeout_ms: 5000,
            request_timeout_ms: 5000,
            username: String::new(),
            password: String::new(),
        }
    }
}

impl EtcdConfig {
    /// Create a config with a single endpoint
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoints: vec![endpoint.to_string()],
            ..Default::default()
        }
    }

    /// Create a config with multiple endpoints
    pub fn with_endpoints(endpoints: Vec<String>) -> Self {
        Self {
            endpoints,
            ..Default::default()
        }
    }

    /// Set authentication credentials
    pub fn with_auth(mut self, username: &str, password: &str) -> Self {
        self.username = username.to_string();
        self.password = password.to_string();
        self
    }

    /// Set timeouts
    pub fn with_timeouts(mut self, dial_ms: u64, request_ms: u64) -> Self {
        self.dial_timeout_ms = dial_ms;
        self.request_timeout_ms = request_ms;
        self
    }

    pub fn has_auth(&self) -> bool {
        !self.username.is_empty()
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Load the `[etcd]` section from `path` (if given) and the environment.
    ///
    /// `BATATA_ETCD__ENDPOINTS` takes a comma separated list.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let env = environment()
            .list_separator(",")
            .with_list_parse_key("etcd.endpoints");
        load_section_with(path, ETCD_SECTION, env)
    }
}
