//! Load config from file and environment.

use std::path::{Path, PathBuf};

use anyhow::Context;
use seek_core::ClientOptions;
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/seek/config.toml or /etc/seek/config.toml.
/// Env overrides: SEEK_SERVER, SEEK_USERNAME, SEEK_LOG, SEEK_MESSAGE_TIMEOUT_MS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Server `host:port` (default server.slsknet.org:2242).
    #[serde(default = "default_server")]
    pub server: String,
    /// Session username. Without one the daemon connects but stays logged out.
    #[serde(default)]
    pub username: Option<String>,
    /// trace, debug, info, warn or error (default info).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub client: ClientOptions,
}

fn default_server() -> String {
    "server.slsknet.org:2242".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: default_server(),
            username: None,
            log_level: default_log_level(),
            client: ClientOptions::default(),
        }
    }
}

/// Load config: defaults, then the first config file found, then env vars.
pub fn load() -> anyhow::Result<Config> {
    let mut c = match config_paths().into_iter().find(|p| p.exists()) {
        Some(path) => load_file(&path)?,
        None => Config::default(),
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("SEEK_SERVER") {
        c.server = s;
    }
    if let Some(s) = var("SEEK_USERNAME") {
        c.username = Some(s).filter(|u| !u.trim().is_empty());
    }
    if let Some(s) = var("SEEK_LOG") {
        c.log_level = s;
    }
    if let Some(s) = var("SEEK_MESSAGE_TIMEOUT_MS") {
        if let Ok(ms) = s.parse::<u64>() {
            c.client.message_timeout_ms = ms;
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/seek/config.toml"));
    }
    out.push(PathBuf::from("/etc/seek/config.toml"));
    out
}

fn load_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse(&s).with_context(|| format!("parsing {}", path.display()))
}

fn parse(s: &str) -> anyhow::Result<Config> {
    Ok(toml::from_str(s)?)
}
