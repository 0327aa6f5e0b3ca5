//! # Configuration
//!
//! Settings live in `keystone.toml`. Every section is optional:
//!
//! ```toml
//! schema = "schema.toml"
//!
//! [remote]
//! base_url = "http://localhost:3000"
//! api_key = "secret"
//!
//! [retry]
//! max_attempts = 3
//! base_delay_ms = 100
//! max_delay_ms = 5000
//!
//! [rate_limit]
//! requests_per_second = 0   # 0 disables client-side throttling
//!
//! [cache]
//! soft_ttl_ms = 30000
//! hard_ttl_ms = 300000
//! ```
//!
//! Environment overrides, applied after the file:
//! - `KEYSTONE_URL`: remote base URL
//! - `KEYSTONE_API_KEY`: bearer token
//! - `KEYSTONE_RATE_LIMIT`: requests per second

use keystone_core::{KeystoneError, Schema};
use keystone_request::handlers::RetryConfig;
use keystone_request::CachePolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Config file looked up in the working directory when `--config` is absent.
pub const CONFIG_FILE_NAME: &str = "keystone.toml";

/// Maximum size of a config or schema file (1 MB).
const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

fn default_base_url() -> String {
    "http://localhost:3000".to_string()
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests per second; `0` disables throttling.
    #[serde(default)]
    pub requests_per_second: u32,
}

/// Full application configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeystoneConfig {
    /// Schema file, relative to the config file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<PathBuf>,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub cache: CachePolicy,
}

impl KeystoneConfig {
    /// Load configuration.
    ///
    /// An explicit `path` must exist. Without one, `keystone.toml` in the
    /// working directory is used if present, defaults otherwise. Process
    /// environment overrides are applied last.
    pub fn load(path: Option<&Path>) -> Result<Self, KeystoneError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(CONFIG_FILE_NAME).is_file() => {
                Self::from_file(Path::new(CONFIG_FILE_NAME))?
            }
            None => {
                tracing::debug!("No config file, using defaults");
                Self::default()
            }
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Read and parse a config file. A relative `schema` path is resolved
    /// against the file's directory.
    pub fn from_file(path: &Path) -> Result<Self, KeystoneError> {
        let content = read_limited(path)?;
        let mut config: Self = toml::from_str(&content).map_err(|e| {
            KeystoneError::Config(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        if let (Some(schema), Some(dir)) = (&config.schema, path.parent())
            && schema.is_relative()
        {
            config.schema = Some(dir.join(schema));
        }
        tracing::debug!(path = %path.display(), "Loaded config file");
        Ok(config)
    }

    /// Apply `KEYSTONE_*` overrides from `lookup`.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), KeystoneError> {
        if let Some(url) = lookup("KEYSTONE_URL") {
            self.remote.base_url = url;
        }
        if let Some(key) = lookup("KEYSTONE_API_KEY") {
            self.remote.api_key = (!key.is_empty()).then_some(key);
        }
        if let Some(rps) = lookup("KEYSTONE_RATE_LIMIT") {
            self.rate_limit.requests_per_second = rps.trim().parse().map_err(|_| {
                KeystoneError::Config(format!("KEYSTONE_RATE_LIMIT must be an integer, got '{rps}'"))
            })?;
        }
        Ok(())
    }

    /// Load and validate the configured schema; an empty schema if none is
    /// configured.
    pub fn load_schema(&self) -> Result<Schema, KeystoneError> {
        let Some(path) = &self.schema else {
            return Ok(Schema::new());
        };
        let content = read_limited(path)?;
        let schema: Schema = toml::from_str(&content).map_err(|e| {
            KeystoneError::Config(format!(
                "Failed to parse schema file '{}': {}",
                path.display(),
                e
            ))
        })?;
        schema.validate()?;
        Ok(schema)
    }

    /// Default config file content with comments.
    #[must_use]
    pub fn default_toml() -> &'static str {
        r#"# Keystone configuration
#
# Schema file with [types.<name>] tables (relative to this file).
# schema = "schema.toml"

[remote]
base_url = "http://localhost:3000"
# api_key = "your-api-key"

[retry]
max_attempts = 3
base_delay_ms = 100
max_delay_ms = 5000

# Client-side throttling; 0 disables it.
[rate_limit]
requests_per_second = 0

# Request cache: serve fresh, refresh after soft_ttl, refetch after hard_ttl.
[cache]
soft_ttl_ms = 30000
hard_ttl_ms = 300000
"#
    }
}

fn read_limited(path: &Path) -> Result<String, KeystoneError> {
    let metadata = std::fs::metadata(path).map_err(|e| {
        KeystoneError::Config(format!("Cannot read '{}': {}", path.display(), e))
    })?;
    if metadata.len() > MAX_CONFIG_FILE_SIZE {
        return Err(KeystoneError::Config(format!(
            "File '{}' is {} bytes, maximum is {}",
            path.display(),
            metadata.len(),
            MAX_CONFIG_FILE_SIZE
        )));
    }
    std::fs::read_to_string(path)
        .map_err(|e| KeystoneError::Config(format!("Cannot read '{}': {}", path.display(), e)))
}
