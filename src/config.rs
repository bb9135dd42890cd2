//! Configuration parsing and validation.
//!
//! Hierarchy Manager reads a TOML file (default `./config/hmgr.toml`):
//!
//! ```toml
//! [db]
//! path = "./data/queue.sqlite"
//!
//! [instance]
//! url = "https://kenya.example.org"
//! username = "admin"
//!
//! [worker]
//! tool = "cht"
//! poll_interval_secs = 30
//!
//! [resolver]
//! fuzz = true
//!
//! [[contact_types]]
//! name = "c_community_health_unit"
//! friendly = "Community Health Unit"
//! # levels and properties as in `hierarchy_core::config`
//! ```
//!
//! A few settings come from the environment and win over the file:
//!
//! | Variable | Setting |
//! |----------|---------|
//! | `HMGR_QUEUE_DB` | `db.path` |
//! | `HMGR_JOB_SECRET` | key that signs job credentials |
//! | `HMGR_PASSWORD` | `instance.password` |

use anyhow::{bail, Context, Result};
use hierarchy_core::config::{ContactType, HierarchyConfig};
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub instance: InstanceConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub job_secret: Option<String>,
    #[serde(default)]
    pub contact_types: Vec<ContactType>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Deserialize, Clone)]
pub struct InstanceConfig {
    pub url: String,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_request_timeout_secs() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    /// Configuration tool the worker shells out to.
    #[serde(default = "default_tool")]
    pub tool: String,
    /// How long an idle worker sleeps before polling the queue again.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tool: default_tool(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

fn default_tool() -> String {
    "cht".to_string()
}
fn default_poll_interval_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResolverConfig {
    #[serde(default = "default_fuzz")]
    pub fuzz: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            fuzz: default_fuzz(),
        }
    }
}

fn default_fuzz() -> bool {
    true
}

fn redacted(secret: &Option<String>) -> Option<&'static str> {
    secret.as_ref().map(|_| "[REDACTED]")
}

impl fmt::Debug for InstanceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceConfig")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &redacted(&self.password))
            .field("timeout_secs", &self.timeout_secs)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("db", &self.db)
            .field("instance", &self.instance)
            .field("worker", &self.worker)
            .field("resolver", &self.resolver)
            .field("job_secret", &redacted(&self.job_secret))
            .field("contact_types", &self.contact_types)
            .finish()
    }
}

impl Config {
    pub fn hierarchy(&self) -> Result<HierarchyConfig> {
        HierarchyConfig::new(self.contact_types.clone())
    }

    /// Key for signing and checking job credentials.
    pub fn job_secret(&self) -> Result<&str> {
        match self.job_secret.as_deref() {
            Some(secret) if !secret.is_empty() => Ok(secret),
            _ => bail!("HMGR_JOB_SECRET must be set to schedule or run mutation jobs"),
        }
    }

    pub fn password(&self) -> Result<&str> {
        match self.instance.password.as_deref() {
            Some(password) if !password.is_empty() => Ok(password),
            _ => bail!(
                "No password for '{}': set HMGR_PASSWORD",
                self.instance.username
            ),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content, |key| std::env::var(key).ok())
}

/// Parse, apply environment overrides from `env`, and validate.
pub fn parse_config(content: &str, env: impl Fn(&str) -> Option<String>) -> Result<Config> {
    let mut config: Config =
        toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if let Some(path) = env("HMGR_QUEUE_DB") {
        config.db.path = PathBuf::from(path);
    }
    if let Some(secret) = env("HMGR_JOB_SECRET") {
        config.job_secret = Some(secret);
    }
    if let Some(password) = env("HMGR_PASSWORD") {
        config.instance.password = Some(password);
    }

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.db.path.as_os_str().is_empty() {
        bail!("db.path must not be empty");
    }

    let url = config.instance.url.trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        bail!(
            "instance.url must start with http:// or https://, got '{}'",
            config.instance.url
        );
    }
    if config.instance.username.trim().is_empty() {
        bail!("instance.username must not be empty");
    }

    if config.worker.tool.trim().is_empty() {
        bail!("worker.tool must not be empty");
    }
    if config.worker.poll_interval_secs == 0 {
        bail!("worker.poll_interval_secs must be > 0");
    }

    let mut seen = HashSet::new();
    for contact_type in &config.contact_types {
        if !seen.insert(contact_type.name.as_str()) {
            bail!("contact type '{}' is configured twice", contact_type.name);
        }
    }
    config.hierarchy()?;

    Ok(())
}
