use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;

use crate::types::Subsystem;

/// Top-level configuration
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub exporter: ExporterConfig,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub collect: Vec<CollectTarget>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExporterConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Optional namespace prefix overriding the per-subsystem default
    #[serde(default)]
    pub namespace: Option<String>,
    /// Static labels attached to every exported metric
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_id_retry_interval")]
    pub id_retry_interval_secs: u64,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            log_level: default_log_level(),
            namespace: None,
            labels: HashMap::new(),
            request_timeout_secs: default_request_timeout(),
            id_retry_interval_secs: default_id_retry_interval(),
        }
    }
}

/// One monitored server instance
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub url: String,
    /// Stable server ID; resolved from the status endpoint when omitted
    #[serde(default)]
    pub id: Option<String>,
}

/// One subsystem to poll, across one or more monitoring endpoints
#[derive(Debug, Deserialize, Clone)]
pub struct CollectTarget {
    pub subsystem: Subsystem,
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,
    /// Field names whose values accumulate instead of replace
    #[serde(default)]
    pub counter_fields: Vec<String>,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        // Expand environment variables
        let expanded = expand_env_vars(&content);

        let config: Config = toml::from_str(&expanded)
            .with_context(|| "Failed to parse configuration")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            bail!("At least one [[servers]] entry is required");
        }
        for server in &self.servers {
            if server.url.is_empty() {
                bail!("Server URL must not be empty");
            }
        }
        if self.collect.is_empty() {
            bail!("At least one [[collect]] target is required");
        }
        for target in &self.collect {
            if target.endpoints.is_empty() {
                bail!("Collect target for subsystem '{}' has no endpoints", target.subsystem);
            }
        }
        Ok(())
    }
}

/// Expand ${ENV_VAR} references in config string
fn expand_env_vars(input: &str) -> String {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").unwrap();
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .to_string()
}

// Default value functions
fn default_listen_addr() -> String { "0.0.0.0:7777".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_request_timeout() -> u64 { 5 }
fn default_id_retry_interval() -> u64 { 2 }
fn default_endpoints() -> Vec<String> { vec!["statusz".into()] }
