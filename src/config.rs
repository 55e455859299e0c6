use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_dial_timeout() -> u64 {
    30
}

fn default_keep_alive() -> u64 {
    15
}

fn default_idle_timeout() -> u64 {
    90
}

fn default_max_idle_conns_per_host() -> usize {
    200
}

fn default_max_replays() -> u32 {
    3
}

/// How connections for one named transport are dialed, pooled and used.
///
/// Two snapshots compare equal only when every field matches; the builder
/// relies on that to decide whether warm pools survive a configuration update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportSettings {
    /// Upper bound for establishing a connection, proxy handshakes included.
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,
    /// TCP keep-alive probe interval. 0 disables keep-alive probes.
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// How long a connection may sit idle in the pool. 0 = no expiry.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Time allowed between the end of the request write and the response head.
    /// 0 = wait as long as the request context lives.
    #[serde(default)]
    pub response_header_timeout_secs: u64,
    /// Idle connections cached per target. 0 disables reuse.
    #[serde(default = "default_max_idle_conns_per_host")]
    pub max_idle_conns_per_host: usize,
    #[serde(default)]
    pub pass_host_header: bool,
    #[serde(default)]
    pub preserve_path: bool,
    /// Forward upgrade requests as plain requests, dropping the upgrade intent.
    #[serde(default)]
    pub disable_upgrade: bool,
    /// TLS server name override; defaults to the target host.
    #[serde(default)]
    pub server_name: Option<String>,
    /// Extra PEM root certificates trusted for upstream TLS.
    #[serde(default)]
    pub root_ca_file: Option<PathBuf>,
    /// Transparent replays allowed for a replayable request whose write failed
    /// before any byte reached the socket.
    #[serde(default = "default_max_replays")]
    pub max_replays: u32,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            dial_timeout_secs: default_dial_timeout(),
            keep_alive_secs: default_keep_alive(),
            idle_timeout_secs: default_idle_timeout(),
            response_header_timeout_secs: 0,
            max_idle_conns_per_host: default_max_idle_conns_per_host(),
            pass_host_header: false,
            preserve_path: false,
            disable_upgrade: false,
            server_name: None,
            root_ca_file: None,
            max_replays: default_max_replays(),
        }
    }
}

impl TransportSettings {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn keep_alive(&self) -> Option<Duration> {
        (self.keep_alive_secs > 0).then(|| Duration::from_secs(self.keep_alive_secs))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn response_header_timeout(&self) -> Option<Duration> {
        (self.response_header_timeout_secs > 0)
            .then(|| Duration::from_secs(self.response_header_timeout_secs))
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_transport_name() -> String {
    "default".to_string()
}

fn default_max_response_header_bytes() -> usize {
    64 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// Upstream every inbound request is forwarded to by the bundled binary.
    #[serde(default)]
    pub target: Option<String>,
    /// Transport used for `target`.
    #[serde(default = "default_transport_name")]
    pub transport: String,
    /// Marks outbound requests with the debug header.
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub transports: HashMap<String, TransportSettings>,
    #[serde(default = "default_max_response_header_bytes")]
    pub max_response_header_bytes: usize,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut transports = HashMap::new();
        transports.insert(default_transport_name(), TransportSettings::default());
        Self {
            listen_addr: default_listen_addr(),
            target: None,
            transport: default_transport_name(),
            debug: false,
            transports,
            max_response_header_bytes: default_max_response_header_bytes(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> Result<(), Box<dyn std::error::Error>> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }
}

pub fn validate(config: &EngineConfig) -> ValidationResult {
    let mut result = ValidationResult::default();

    match &config.target {
        Some(target) => match url::Url::parse(target) {
            Ok(url) if !matches!(url.scheme(), "http" | "https" | "ws" | "wss") => {
                result.add_error(format!("Unsupported target scheme: {}", url.scheme()));
            }
            Ok(url) if url.host_str().is_none() => {
                result.add_error(format!("Target URL has no host: {}", target));
            }
            Ok(_) => {}
            Err(e) => result.add_error(format!("Invalid target URL {}: {}", target, e)),
        },
        None => result.add_warning("No target configured".to_string()),
    }

    if !config.transports.contains_key(&config.transport) {
        result.add_warning(format!(
            "Transport '{}' is not defined, defaults will be used",
            config.transport
        ));
    }

    for (name, settings) in &config.transports {
        if settings.dial_timeout_secs == 0 {
            result.add_error(format!("Transport '{}': dial_timeout_secs must be > 0", name));
        }
        if settings.max_idle_conns_per_host == 0 {
            result.add_warning(format!("Transport '{}': connection reuse disabled", name));
        }
        if let Some(path) = &settings.root_ca_file {
            if !path.exists() {
                result.add_error(format!(
                    "Transport '{}': root CA file not found: {}",
                    name,
                    path.display()
                ));
            }
        }
    }

    if config.max_response_header_bytes < 1024 {
        result.add_error("max_response_header_bytes must be at least 1024".to_string());
    }

    result
}
