use anyhow::{Context, Result};
use serde::Deserialize;
use std::{fs, path::Path};

pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen: ListenConfig,
    pub rules: RulesConfig,
    pub upstream: UpstreamConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    pub ip: String,
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            ip: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Comma-separated rule lists. Empty strings mean "not configured".
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    pub accept_source_ips: String,
    pub deny_source_ips: String,
    pub deny_url_paths: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// PEM bundle of CAs trusted for https forwarded URLs.
    pub ca_file: Option<String>,
}

impl Config {
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse configuration as valid TOML")
    }

    /// Applies environment-style overrides on top of the file values.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT") {
            self.listen.port = port
                .trim()
                .parse()
                .with_context(|| format!("Invalid PORT value: {port}"))?;
        }
        if let Some(value) = lookup("ACCEPT_SOURCE_IPS") {
            self.rules.accept_source_ips = value;
        }
        if let Some(value) = lookup("DENY_SOURCE_IPS") {
            self.rules.deny_source_ips = value;
        }
        if let Some(value) = lookup("DENY_URL_PATHS") {
            self.rules.deny_url_paths = value;
        }
        if let Some(value) = lookup("UPSTREAM_CA_FILE") {
            self.upstream.ca_file = Some(value);
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {} file", path.display()))?;
    Config::from_toml(&content)
}
