//! Configuration module
//!
//! Loads the sidecar configuration from an optional TOML file, then overlays
//! the `AMF_GRPC_*` / `AMF_CNODE_*` environment variables. The result is
//! built once at startup and handed to each subsystem by value.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::protocol::{DEFAULT_CNODE_PORT, DEFAULT_HEALTH_PORT};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Health server and registration settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Cnode client settings
    #[serde(default)]
    pub cnode: CnodeConfig,
}

/// General configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
    /// Explicit tracing filter (e.g. "amf_sidecar=debug")
    pub log_filter: Option<String>,
}

/// Health server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Run the health server at all
    #[serde(default = "default_true")]
    pub enable: bool,
    /// Address to bind the listener to
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Address announced to the registration server (defaults to bind_addr)
    pub advertise_ip: Option<String>,
    /// Port to listen on
    #[serde(default = "default_health_port")]
    pub port: u16,
    /// How long to wait for a request frame before answering anyway (ms)
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
    /// Registration client settings
    #[serde(default)]
    pub registration: RegistrationConfig,
}

/// Registration client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationConfig {
    /// Send a registration once the node is operational
    #[serde(default)]
    pub enable: bool,
    /// Registration server address
    pub server_ip: Option<String>,
    /// Registration server port
    pub server_port: Option<u16>,
    /// Connect, send and receive deadline (ms)
    #[serde(default = "default_io_timeout")]
    pub timeout_ms: u64,
}

/// Cnode client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CnodeConfig {
    /// Run the cnode client (still requires server_ip)
    #[serde(default = "default_true")]
    pub enable: bool,
    /// Cnode server address; unset disables the client
    pub server_ip: Option<String>,
    /// Cnode server port
    #[serde(default = "default_cnode_port")]
    pub server_port: u16,
    /// Connect and send deadline (ms)
    #[serde(default = "default_io_timeout")]
    pub connect_timeout_ms: u64,
    /// Longest wait for inbound data before re-checking the stop flag (ms)
    #[serde(default = "default_io_timeout")]
    pub poll_interval_ms: u64,
    /// First reconnect delay (s)
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_secs: u64,
    /// Reconnect delay cap (s)
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_health_port() -> u16 {
    DEFAULT_HEALTH_PORT
}

fn default_cnode_port() -> u16 {
    DEFAULT_CNODE_PORT
}

fn default_read_timeout() -> u64 {
    500
}

fn default_io_timeout() -> u64 {
    5000
}

fn default_initial_backoff() -> u64 {
    1
}

fn default_max_backoff() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enable: default_true(),
            bind_addr: default_bind_addr(),
            advertise_ip: None,
            port: default_health_port(),
            read_timeout_ms: default_read_timeout(),
            registration: RegistrationConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Socket address the listener binds to
    pub fn bind_socket_addr(&self) -> ConfigResult<SocketAddr> {
        let ip: IpAddr = self
            .bind_addr
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(self.bind_addr.clone()))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    /// IP sent in RegisterRequest
    pub fn advertise_ip(&self) -> &str {
        match self.advertise_ip.as_deref() {
            Some(ip) if !ip.is_empty() => ip,
            _ => &self.bind_addr,
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            enable: false,
            server_ip: None,
            server_port: None,
            timeout_ms: default_io_timeout(),
        }
    }
}

impl RegistrationConfig {
    /// Registration server host and port, if both are set
    pub fn target(&self) -> Option<(&str, u16)> {
        let ip = self.server_ip.as_deref().filter(|ip| !ip.is_empty())?;
        let port = self.server_port.filter(|port| *port > 0)?;
        Some((ip, port))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for CnodeConfig {
    fn default() -> Self {
        Self {
            enable: default_true(),
            server_ip: None,
            server_port: default_cnode_port(),
            connect_timeout_ms: default_io_timeout(),
            poll_interval_ms: default_io_timeout(),
            initial_backoff_secs: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
        }
    }
}

impl CnodeConfig {
    /// Cnode server host and port, if the client should run at all
    pub fn target(&self) -> Option<(&str, u16)> {
        if !self.enable {
            return None;
        }
        let ip = self.server_ip.as_deref().filter(|ip| !ip.is_empty())?;
        Some((ip, self.server_port))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Parse a positive port number, ignoring anything else
fn parse_port(value: &str) -> Option<u16> {
    value.trim().parse::<u16>().ok().filter(|port| *port > 0)
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("amf-sidecar/config.toml")),
            Some(PathBuf::from("./amf-sidecar.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Overlay the process environment
    pub fn apply_process_env(&mut self) {
        self.apply_env(|key| std::env::var(key).ok());
    }

    /// Overlay environment variables obtained through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let server = &mut self.server;

        if let Some(value) = lookup("AMF_GRPC_ENABLE") {
            server.enable = value == "1";
        }
        if let Some(port) = lookup("AMF_GRPC_PORT").as_deref().and_then(parse_port) {
            server.port = port;
        }
        if let Some(addr) = lookup("AMF_GRPC_BIND_ADDR").and_then(non_empty) {
            server.bind_addr = addr;
        }
        if let Some(ip) = lookup("AMF_GRPC_ADVERTISE_IP").and_then(non_empty) {
            server.advertise_ip = Some(ip);
        }

        let registration = &mut server.registration;
        if let Some(value) = lookup("AMF_GRPC_REGISTRATION_ENABLE") {
            registration.enable = value == "1";
        }
        if let Some(ip) = lookup("AMF_GRPC_REGISTRATION_SERVER_IP") {
            registration.server_ip = non_empty(ip);
        }
        if let Some(port) = lookup("AMF_GRPC_REGISTRATION_SERVER_PORT")
            .as_deref()
            .and_then(parse_port)
        {
            registration.server_port = Some(port);
        }

        let cnode = &mut self.cnode;
        if let Some(value) = lookup("AMF_CNODE_ENABLE") {
            cnode.enable = value == "1";
        }
        if let Some(ip) = lookup("AMF_CNODE_SERVER_IP") {
            cnode.server_ip = non_empty(ip);
        }
        if let Some(port) = lookup("AMF_CNODE_SERVER_PORT").as_deref().and_then(parse_port) {
            cnode.server_port = port;
        }
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> String {
    let config = Config {
        server: ServerConfig {
            advertise_ip: Some("10.0.0.1".to_string()),
            registration: RegistrationConfig {
                enable: true,
                server_ip: Some("10.0.0.100".to_string()),
                server_port: Some(50052),
                ..Default::default()
            },
            ..Default::default()
        },
        cnode: CnodeConfig {
            server_ip: Some("10.0.0.200".to_string()),
            ..Default::default()
        },
        ..Default::default()
    };

    toml::to_string_pretty(&config).unwrap_or_default()
}
