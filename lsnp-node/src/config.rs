//! Load config from file and environment.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use lsnp_core::protocol::{ACK_TIMEOUT_SECS, DEFAULT_TOKEN_TTL_SECS, MAX_RETRIES};
use lsnp_core::{CoreConfig, DEFAULT_PORT};
use anyhow::Context;
use serde::Deserialize;

use crate::engine::EngineConfig;

/// Daemon configuration. File: ~/.config/lsnp/config.toml or /etc/lsnp/config.toml.
/// Env overrides: LSNP_PORT, LSNP_USER_ID, LSNP_VERBOSE.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// UDP port (default 50999).
    #[serde(default = "default_port")]
    pub port: u16,
    /// `name@host` identity; derived from $USER and the local IP when unset.
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default = "default_broadcast_addr")]
    pub broadcast_addr: Ipv4Addr,
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
    /// Unset keeps peers forever.
    #[serde(default)]
    pub peer_ttl_secs: Option<u64>,
    /// PING broadcast period (default 300s).
    #[serde(default = "default_presence_interval")]
    pub presence_interval_secs: u64,
    #[serde(default)]
    pub simulated_loss: f64,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_status() -> String {
    "Online".to_string()
}
fn default_broadcast_addr() -> Ipv4Addr {
    Ipv4Addr::BROADCAST
}
fn default_token_ttl() -> u64 {
    DEFAULT_TOKEN_TTL_SECS
}
fn default_ack_timeout() -> u64 {
    ACK_TIMEOUT_SECS
}
fn default_max_retries() -> u32 {
    MAX_RETRIES
}
fn default_sweep_interval() -> u64 {
    1000
}
fn default_dedup_capacity() -> usize {
    lsnp_core::dedup::DEFAULT_DEDUP_CAPACITY
}
fn default_presence_interval() -> u64 {
    300
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            user_id: None,
            display_name: None,
            status: default_status(),
            verbose: false,
            broadcast_addr: default_broadcast_addr(),
            token_ttl_secs: default_token_ttl(),
            ack_timeout_secs: default_ack_timeout(),
            max_retries: default_max_retries(),
            sweep_interval_ms: default_sweep_interval(),
            dedup_capacity: default_dedup_capacity(),
            peer_ttl_secs: None,
            presence_interval_secs: default_presence_interval(),
            simulated_loss: 0.0,
        }
    }
}

impl Config {
    /// Identity to use: configured, or `$USER@local_ip`.
    pub fn resolved_user_id(&self, local_ip: Option<IpAddr>) -> String {
        if let Some(id) = &self.user_id {
            return id.clone();
        }
        let user = std::env::var("USER").unwrap_or_else(|_| "user".to_string());
        let host = local_ip.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        format!("{}@{}", user, host)
    }

    pub fn engine_config(&self, local_ip: Option<IpAddr>) -> EngineConfig {
        let mut core = CoreConfig::new(self.resolved_user_id(local_ip), self.port);
        core.local_ips = local_ip.into_iter().collect();
        core.broadcast_addr = self.broadcast_addr;
        core.token_ttl_secs = self.token_ttl_secs;
        core.ack_timeout_millis = self.ack_timeout_secs.saturating_mul(1000);
        core.max_retries = self.max_retries;
        core.dedup_capacity = self.dedup_capacity;
        core.peer_ttl_millis = self.peer_ttl_secs.map(|s| s.saturating_mul(1000));
        core.simulated_loss = self.simulated_loss.clamp(0.0, 1.0);
        EngineConfig {
            core,
            sweep_interval: Duration::from_millis(self.sweep_interval_ms.max(10)),
            ..EngineConfig::default()
        }
    }
}

/// Load config: defaults, then the config file (explicit path or the first standard
/// location that exists), then env vars. A config file that exists but does not parse is an error.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let path = match explicit {
        Some(p) => Some(p.to_path_buf()),
        None => config_paths().into_iter().find(|p| p.exists()),
    };
    let mut c = match path {
        Some(p) => parse_file(&p).with_context(|| format!("reading {}", p.display()))?,
        None => Config::default(),
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = var("LSNP_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.port = p;
    }
    if let Some(id) = var("LSNP_USER_ID").filter(|s| !s.is_empty()) {
        c.user_id = Some(id);
    }
    if let Some(v) = var("LSNP_VERBOSE") {
        c.verbose = matches!(v.as_str(), "1" | "true" | "yes");
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/lsnp/config.toml"));
    }
    out.push(PathBuf::from("/etc/lsnp/config.toml"));
    out
}

fn parse_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)?;
    Ok(toml::from_str::<Config>(&s)?)
}
