//! Configuration for the transport engine.
//!
//! All settings are plain data with serde derives so deployments can load
//! them from a TOML profile; defaults match a direct (proxy-less, plaintext)
//! HTTP deployment.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// How the pool picks the next host after the active one is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RotationStrategy {
    /// Scan from the head of the pool and take the first alive host.
    RoundRobin,
    /// Pick a uniformly random host, falling back to round-robin if the
    /// pick is dead.
    Random,
}

impl Default for RotationStrategy {
    fn default() -> Self {
        RotationStrategy::RoundRobin
    }
}

/// One candidate controller destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEndpoint {
    /// Host name or address, without port.
    pub address: String,
    /// TCP port.
    pub port: u16,
}

/// A fixed egress proxy, used instead of automatic discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedProxy {
    /// Proxy URL, e.g. `http://proxy.corp:8080`.
    pub url: String,
    /// Optional basic-auth username.
    #[serde(default)]
    pub username: Option<String>,
    /// Optional basic-auth password.
    #[serde(default)]
    pub password: Option<String>,
}

/// Settings for the HTTP carrier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Candidate destinations, in configuration order.
    pub hosts: Vec<HostEndpoint>,
    /// Rotation strategy used when the active host exhausts its budget.
    #[serde(default)]
    pub rotation: RotationStrategy,
    /// Per-host failure budget before the host is marked dead.
    /// 0 means retry forever: once every host is dead the pool resurrects
    /// all of them and starts over (default: 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// User agent presented on every request.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Fixed request method (default: POST).
    #[serde(default = "default_method")]
    pub method: String,
    /// Endpoint path candidates; one is chosen uniformly at random per
    /// send, independent of host rotation.
    #[serde(default = "default_uris")]
    pub uris: Vec<String>,
    /// Extra request headers. A header that fails to parse is logged and
    /// skipped, never fatal.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Use HTTPS. The controller certificate is self-issued, so chain,
    /// host and date validation are bypassed when this is set.
    #[serde(default)]
    pub secure: bool,
    /// Fixed proxy. When unset, the proxy is discovered from the
    /// environment once per rotation epoch.
    #[serde(default)]
    pub proxy: Option<FixedProxy>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_user_agent() -> String {
    "relink-agent/0.1".to_string()
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_uris() -> Vec<String> {
    vec!["/".to_string()]
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            hosts: Vec::new(),
            rotation: RotationStrategy::default(),
            max_retries: default_max_retries(),
            user_agent: default_user_agent(),
            method: default_method(),
            uris: default_uris(),
            headers: HashMap::new(),
            secure: false,
            proxy: None,
        }
    }
}

/// Settings for the local pipe carrier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeConfig {
    /// Filesystem path of the pipe endpoint (default:
    /// `/tmp/relink-agent.sock`).
    #[serde(default = "default_pipe_path")]
    pub path: PathBuf,
}

fn default_pipe_path() -> PathBuf {
    PathBuf::from("/tmp/relink-agent.sock")
}

impl Default for PipeConfig {
    fn default() -> Self {
        PipeConfig {
            path: default_pipe_path(),
        }
    }
}

/// Which carrier the transport uses, fixed at deploy time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum CarrierConfig {
    /// Beaconing HTTP(S) carrier.
    Http(HttpConfig),
    /// Local inter-process carrier over a named bidirectional pipe.
    Pipe(PipeConfig),
}

/// Top-level transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// This agent's identifier; inbound pipe frames carrying a different
    /// id are rejected.
    pub agent_id: u32,
    /// Carrier selection and settings.
    pub carrier: CarrierConfig,
}
