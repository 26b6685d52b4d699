//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.runprobe/config.json`) and environment.
//! Every section has defaults, so an empty `{}` is a working config against a local gateway.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Gateway endpoint, auth and timeouts.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// How this client presents itself in `connect`.
    #[serde(default)]
    pub client: ClientConfig,

    /// Session the prompts go to.
    #[serde(default)]
    pub session: SessionConfig,

    /// Run completion timeouts.
    #[serde(default)]
    pub runs: RunsConfig,

    /// Device identity file.
    #[serde(default)]
    pub device: DeviceConfig,

    /// Flag-toggle benchmark settings.
    #[serde(default)]
    pub bench: BenchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// WebSocket URL (default ws://127.0.0.1:18789).
    #[serde(default = "default_gateway_url")]
    pub url: String,

    /// Shared secret sent as connect auth.token. Overridden by RUNPROBE_GATEWAY_TOKEN env.
    pub token: Option<String>,

    /// Time allowed from socket open to an authenticated connect (default 15s).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Per-request timeout for ordinary methods (default 30s).
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_protocol")]
    pub min_protocol: u32,

    #[serde(default = "default_protocol")]
    pub max_protocol: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    #[serde(default = "default_client_id")]
    pub id: String,
    #[serde(default = "default_display_name")]
    pub display_name: String,
    #[serde(default = "default_client_mode")]
    pub mode: String,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    #[serde(default = "default_locale")]
    pub locale: String,
    /// Reported platform; defaults to the host OS.
    #[serde(default = "default_platform")]
    pub platform: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Session key used for chat.send, sessions.reset and token lookup.
    #[serde(default = "default_session_key")]
    pub key: String,
    /// Agent whose sessions are listed for token accounting.
    #[serde(default = "default_agent_id")]
    pub agent_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunsConfig {
    /// Overall deadline for one run to finish (default 30 minutes; runs may use tools for a long time).
    #[serde(default = "default_agent_wait_timeout_ms")]
    pub agent_wait_timeout_ms: u64,
    /// Extra time the agent.wait request gets beyond the deadline.
    #[serde(default = "default_wait_buffer_ms")]
    pub wait_buffer_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    /// Identity file (default ~/.runprobe/device.json).
    pub path: Option<PathBuf>,
    /// When false, a fresh identity is generated per client and nothing is written.
    #[serde(default = "default_true")]
    pub persist: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchConfig {
    /// JSON config file of the serving instance holding the toggled flag.
    pub flag_file: Option<PathBuf>,
    /// JSON pointer of the boolean inside `flag_file` (e.g. "/agents/defaults/memory").
    #[serde(default)]
    pub flag_pointer: String,
    /// Command (argv, no shell) that restarts the serving instance, e.g. ["docker", "restart", "gw"].
    #[serde(default)]
    pub restart_command: Vec<String>,
    /// How long to keep reconnecting after a restart (default 120s).
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
    /// Workspace directory captured after each run.
    pub workspace_dir: Option<PathBuf>,
    /// Where result records and captures go (default ./results).
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
    #[serde(default)]
    pub prompts: Vec<String>,
    #[serde(default = "default_true")]
    pub reset_between_prompts: bool,
}

fn default_gateway_url() -> String {
    "ws://127.0.0.1:18789".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    15_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_protocol() -> u32 {
    3
}

fn default_client_id() -> String {
    "gateway-client".to_string()
}

fn default_display_name() -> String {
    "runprobe".to_string()
}

fn default_client_mode() -> String {
    "backend".to_string()
}

fn default_role() -> String {
    "operator".to_string()
}

fn default_scopes() -> Vec<String> {
    vec!["operator.admin".to_string()]
}

fn default_locale() -> String {
    "en-US".to_string()
}

fn default_platform() -> String {
    std::env::consts::OS.to_string()
}

fn default_session_key() -> String {
    "agent:main:main".to_string()
}

fn default_agent_id() -> String {
    "main".to_string()
}

fn default_agent_wait_timeout_ms() -> u64 {
    30 * 60 * 1000
}

fn default_wait_buffer_ms() -> u64 {
    30_000
}

fn default_ready_timeout_ms() -> u64 {
    120_000
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("results")
}

fn default_true() -> bool {
    true
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: default_gateway_url(),
            token: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            min_protocol: default_protocol(),
            max_protocol: default_protocol(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            id: default_client_id(),
            display_name: default_display_name(),
            mode: default_client_mode(),
            role: default_role(),
            scopes: default_scopes(),
            locale: default_locale(),
            platform: default_platform(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            key: default_session_key(),
            agent_id: default_agent_id(),
        }
    }
}

impl Default for RunsConfig {
    fn default() -> Self {
        Self {
            agent_wait_timeout_ms: default_agent_wait_timeout_ms(),
            wait_buffer_ms: default_wait_buffer_ms(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            path: None,
            persist: true,
        }
    }
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            flag_file: None,
            flag_pointer: String::new(),
            restart_command: Vec::new(),
            ready_timeout_ms: default_ready_timeout_ms(),
            workspace_dir: None,
            results_dir: default_results_dir(),
            prompts: Vec::new(),
            reset_between_prompts: true,
        }
    }
}

/// Resolve the gateway token: env RUNPROBE_GATEWAY_TOKEN overrides config.
pub fn resolve_gateway_token(config: &Config) -> Option<String> {
    std::env::var("RUNPROBE_GATEWAY_TOKEN")
        .ok()
        .and_then(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .or_else(|| {
            config
                .gateway
                .token
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("RUNPROBE_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".runprobe").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Device identity path: `device.path` when set (relative paths resolve against the config
/// file's parent), else the default under the home directory.
pub fn resolve_device_path(config: &Config, config_path: &Path) -> PathBuf {
    match &config.device.path {
        Some(p) if !p.as_os_str().is_empty() => resolve_relative(p, config_path),
        _ => crate::device::default_device_path(),
    }
}

/// Resolve `path` against the config file's parent when it is relative.
pub fn resolve_relative(path: &Path, config_path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .join(path)
}

/// Load config from the default path (or RUNPROBE_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
