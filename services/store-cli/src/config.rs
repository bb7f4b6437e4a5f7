//! Configuration types and loading
//!
//! Config precedence: env vars > config file > defaults. The file itself is
//! chosen on the command line (`--config` or CONFIG_PATH, see `cli`).
//! The login password is loaded from the STORE_PASSWORD env var or
//! password_file, never stored in the TOML directly.

use common::Secret;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub login: LoginConfig,
}

/// Backend connection settings
#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    /// Overridden by the API_BASE_URL env var
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Bound on how long a request waits behind a token refresh. Unbounded
    /// when absent.
    #[serde(default)]
    pub refresh_wait_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    pub credentials_path: PathBuf,
}

/// Defaults for the `login` command
#[derive(Debug, Default, Deserialize)]
pub struct LoginConfig {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(skip)]
    pub password: Option<Secret<String>>,
    /// Path to a file containing the password (alternative to STORE_PASSWORD)
    #[serde(default)]
    pub password_file: Option<PathBuf>,
}

fn default_timeout() -> u64 {
    10
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn refresh_wait_timeout(&self) -> Option<Duration> {
        self.refresh_wait_timeout_secs.map(Duration::from_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Password resolution order:
    /// 1. STORE_PASSWORD env var
    /// 2. password_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(base_url) = std::env::var("API_BASE_URL") {
            config.api.base_url = base_url;
        }

        if !config.api.base_url.starts_with("http://")
            && !config.api.base_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {}",
                config.api.base_url
            )));
        }

        if config.api.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if config.api.refresh_wait_timeout_secs == Some(0) {
            return Err(common::Error::Config(
                "refresh_wait_timeout_secs must be greater than 0 when set".into(),
            ));
        }

        if let Ok(password) = std::env::var("STORE_PASSWORD") {
            config.login.password = Some(Secret::new(password));
        } else if let Some(ref password_file) = config.login.password_file {
            let password = std::fs::read_to_string(password_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read password_file {}: {e}",
                    password_file.display()
                ))
            })?;
            let password = password.trim_end_matches(['\r', '\n']).to_owned();
            if !password.is_empty() {
                config.login.password = Some(Secret::new(password));
            }
        }

        Ok(config)
    }
}
