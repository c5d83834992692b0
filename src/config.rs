//! Proxy configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides. Every
//! field is defaulted, so an empty file (or a missing one, handled by the
//! caller) yields a usable config for the common same-host test topology.
//!
//! Default config path: `/etc/boiler-proxy/proxy.toml`.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Config types (validated, used by the rest of the crate)
// ---------------------------------------------------------------------------

/// Top-level proxy configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub network: NetworkConfig,
    pub analyser: AnalyserConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Interface name (Linux) or IP address (other platforms) facing the IGW.
    pub gateway_iface: String,
    /// Interface name (Linux) or IP address (other platforms) facing the boiler.
    pub boiler_iface: String,
    pub discovery_port: u16,
    pub boiler_tcp_port: u16,
    pub auxiliary_tcp_port: u16,
    /// Port offset applied when source and destination are the same host
    /// (same-machine test topologies).
    pub port_delta: i32,
    pub socket_timeout: Duration,
    pub buffer_size: usize,
    /// Upper bound on one iteration of a component's main loop before it
    /// rechecks shutdown state.
    pub loop_tick: Duration,
}

#[derive(Debug, Clone)]
pub struct AnalyserConfig {
    /// Minimum interval between accepted streaming ("pm") telemetry publications.
    pub scan_period: Duration,
    /// Maps a zero-based index into a `pm` frame's value vector to a bus
    /// channel key published under `info` as `KEY££VALUE`.
    pub telemetry_map: Vec<(usize, String)>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub file_path: Option<String>,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (every field optional)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    network: Option<RawNetworkConfig>,
    analyser: Option<RawAnalyserConfig>,
    logging: Option<RawLoggingConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct RawNetworkConfig {
    gateway_iface: Option<String>,
    boiler_iface: Option<String>,
    discovery_port: Option<u16>,
    boiler_tcp_port: Option<u16>,
    auxiliary_tcp_port: Option<u16>,
    port_delta: Option<i32>,
    socket_timeout_secs: Option<u64>,
    buffer_size: Option<usize>,
    loop_tick_millis: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawAnalyserConfig {
    scan_period_millis: Option<u64>,
    /// `["0:KT", "3:SWV", ...]` — index and channel key joined by `:`.
    telemetry_map: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct RawLoggingConfig {
    level: Option<String>,
    file_path: Option<String>,
}

// ---------------------------------------------------------------------------
// Defaults (grounded in the original implementation's appconfig defaults)
// ---------------------------------------------------------------------------

const DEFAULT_GATEWAY_IFACE: &str = "eth0";
const DEFAULT_BOILER_IFACE: &str = "eth1";
const DEFAULT_DISCOVERY_PORT: u16 = 35601;
const DEFAULT_BOILER_TCP_PORT: u16 = 23;
const DEFAULT_AUXILIARY_TCP_PORT: u16 = 4000;
const DEFAULT_PORT_DELTA: i32 = 1000;
const DEFAULT_SOCKET_TIMEOUT_SECS: u64 = 5;
const DEFAULT_BUFFER_SIZE: usize = 4096;
const DEFAULT_LOOP_TICK_MILLIS: u64 = 1000;
const DEFAULT_SCAN_PERIOD_MILLIS: u64 = 5000;
const DEFAULT_LOG_LEVEL: &str = "info";

/// Telemetry channels this proxy knows how to name. The full parameter
/// catalogue is boiler-model specific and not recoverable from the retrieved
/// sources, so this is a documented, reasonable default subset rather than a
/// transcription of a lost config file (see DESIGN.md).
fn default_telemetry_map() -> Vec<(usize, String)> {
    vec![
        (0, "T_BOILER".to_owned()),
        (1, "T_FLUEGAS".to_owned()),
        (2, "T_OUTSIDE".to_owned()),
        (3, "O2".to_owned()),
    ]
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load proxy config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<ProxyConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load proxy config from the default path `/etc/boiler-proxy/proxy.toml`.
pub fn load_config() -> Result<ProxyConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/boiler-proxy/proxy.toml"))
}

/// Load proxy config from a TOML string, applying defaults for every omitted field.
pub fn load_config_from_str(toml_str: &str) -> Result<ProxyConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let raw_network = raw.network.unwrap_or_default();
    let network = NetworkConfig {
        gateway_iface: raw_network
            .gateway_iface
            .unwrap_or_else(|| DEFAULT_GATEWAY_IFACE.to_owned()),
        boiler_iface: raw_network
            .boiler_iface
            .unwrap_or_else(|| DEFAULT_BOILER_IFACE.to_owned()),
        discovery_port: raw_network.discovery_port.unwrap_or(DEFAULT_DISCOVERY_PORT),
        boiler_tcp_port: raw_network
            .boiler_tcp_port
            .unwrap_or(DEFAULT_BOILER_TCP_PORT),
        auxiliary_tcp_port: raw_network
            .auxiliary_tcp_port
            .unwrap_or(DEFAULT_AUXILIARY_TCP_PORT),
        port_delta: raw_network.port_delta.unwrap_or(DEFAULT_PORT_DELTA),
        socket_timeout: Duration::from_secs(
            raw_network
                .socket_timeout_secs
                .unwrap_or(DEFAULT_SOCKET_TIMEOUT_SECS),
        ),
        buffer_size: raw_network.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE),
        loop_tick: Duration::from_millis(
            raw_network
                .loop_tick_millis
                .unwrap_or(DEFAULT_LOOP_TICK_MILLIS),
        ),
    };

    let raw_analyser = raw.analyser.unwrap_or_default();
    let telemetry_map = match raw_analyser.telemetry_map {
        Some(entries) => parse_telemetry_map(&entries)?,
        None => default_telemetry_map(),
    };
    let analyser = AnalyserConfig {
        scan_period: Duration::from_millis(
            raw_analyser
                .scan_period_millis
                .unwrap_or(DEFAULT_SCAN_PERIOD_MILLIS),
        ),
        telemetry_map,
    };

    let raw_logging = raw.logging.unwrap_or_default();
    let logging = LoggingConfig {
        level: raw_logging.level.unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_owned()),
        file_path: raw_logging.file_path,
    };

    Ok(ProxyConfig {
        network,
        analyser,
        logging,
    })
}

fn parse_telemetry_map(entries: &[String]) -> Result<Vec<(usize, String)>, ConfigError> {
    entries
        .iter()
        .map(|entry| {
            let (idx_str, key) = entry.split_once(':').ok_or_else(|| {
                ConfigError::InvalidValue(format!(
                    "analyser.telemetry_map entry '{entry}' must be 'INDEX:KEY'"
                ))
            })?;
            let idx: usize = idx_str.parse().map_err(|_| {
                ConfigError::InvalidValue(format!(
                    "analyser.telemetry_map entry '{entry}' has a non-numeric index"
                ))
            })?;
            Ok((idx, key.to_owned()))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}
