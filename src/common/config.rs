//! Configuration for coordkv components

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::common::{Error, Result};

/// Directory searched by [`Config::load`].
pub const CONFIG_NAMESPACE: &str = "conf";

/// Extensions tried by [`Config::load`], in order.
pub const CONFIG_EXTENSIONS: &[&str] = &["json", "yaml", "ini", "toml"];

/// Prefix for environment overrides, e.g. `COORDKV_ETCD__REQ_TIMEOUT=5`.
pub const ENV_PREFIX: &str = "COORDKV";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Coordination store connection
    #[serde(default)]
    pub etcd: StoreConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            etcd: StoreConfig::default(),
            log_level: default_log_level(),
        }
    }
}

/// Coordination store connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store endpoints, e.g. `127.0.0.1:2379`
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Dial timeout in seconds
    #[serde(default = "default_dial_timeout", alias = "dial-timeout")]
    pub dial_timeout: u64,

    /// Per-request timeout in seconds
    #[serde(default = "default_req_timeout", alias = "req-timeout")]
    pub req_timeout: u64,
}

fn default_endpoints() -> Vec<String> {
    vec!["127.0.0.1:2379".to_string()]
}
fn default_dial_timeout() -> u64 {
    5
}
fn default_req_timeout() -> u64 {
    3
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            username: None,
            password: None,
            dial_timeout: default_dial_timeout(),
            req_timeout: default_req_timeout(),
        }
    }
}

impl StoreConfig {
    pub fn new(endpoints: Vec<String>, dial_timeout: u64, req_timeout: u64) -> Self {
        Self {
            endpoints,
            dial_timeout,
            req_timeout,
            ..Default::default()
        }
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.req_timeout)
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoints.iter().all(|e| e.trim().is_empty()) {
            return Err(Error::InvalidConfig("no store endpoints configured".into()));
        }
        if self.dial_timeout == 0 {
            return Err(Error::InvalidConfig("dial timeout must be positive".into()));
        }
        if self.req_timeout == 0 {
            return Err(Error::InvalidConfig("request timeout must be positive".into()));
        }
        if self.username.is_some() != self.password.is_some() {
            return Err(Error::InvalidConfig(
                "username and password must be set together".into(),
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Load `conf/<env>/<name>.{json,yaml,ini,toml}` (first match wins), then
    /// apply `COORDKV_*` environment overrides.
    pub fn load(env: &str, name: &str) -> Result<Self> {
        let path = Self::locate(Path::new(CONFIG_NAMESPACE), env, name).ok_or_else(|| {
            Error::InvalidConfig(format!(
                "no config file {}/{}/{}.{{{}}}",
                CONFIG_NAMESPACE,
                env,
                name,
                CONFIG_EXTENSIONS.join(",")
            ))
        })?;
        Self::from_file(path)
    }

    /// Find the first existing config file under `root/<env>/`.
    pub fn locate(root: &Path, env: &str, name: &str) -> Option<PathBuf> {
        let dir = root.join(env);
        CONFIG_EXTENSIONS
            .iter()
            .map(|ext| dir.join(format!("{}.{}", name, ext)))
            .find(|p| p.exists())
    }

    /// Load an explicit file; the format follows its extension.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        tracing::info!("Loading configuration from {}", path.display());
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(env_source())
            .build()?;
        let cfg: Config = settings.try_deserialize()?;
        cfg.etcd.validate()?;
        Ok(cfg)
    }

    /// Defaults plus environment overrides, no file.
    pub fn from_env() -> Result<Self> {
        let settings = config::Config::builder().add_source(env_source()).build()?;
        let cfg: Config = settings.try_deserialize()?;
        cfg.etcd.validate()?;
        Ok(cfg)
    }
}

fn env_source() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("etcd.endpoints")
}
