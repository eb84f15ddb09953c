use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, StationError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StationConfig {
    /// Address both the discovery socket and the TCP listener bind to
    pub bind_ip: IpAddr,
    /// UDP port clients broadcast discovery requests to
    pub discovery_port: u16,
    /// First TCP port tried; the listener scans upward until a bind succeeds
    pub tcp_base_port: u16,
    /// Number of ports tried above `tcp_base_port`
    pub tcp_port_scan_limit: u16,
    /// Name announced in discovery replies (defaults to the hostname)
    pub station_name: Option<String>,
    /// Directory served by the get-file command
    pub log_dir: PathBuf,
    /// Largest file get-file will send
    pub max_file_size_bytes: u64,
    pub pool: PoolConfig,
    pub framing: FramingConfig,
    pub repair_lock: RepairLockConfig,
    pub logging: LoggingConfig,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            discovery_port: 5150,
            tcp_base_port: 5200,
            tcp_port_scan_limit: 100,
            station_name: None,
            log_dir: PathBuf::from("/var/lib/kestrel/logs"),
            max_file_size_bytes: 1_000_000,
            pool: PoolConfig::default(),
            framing: FramingConfig::default(),
            repair_lock: RepairLockConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl StationConfig {
    /// Name announced to clients.
    pub fn station_name(&self) -> String {
        self.station_name.clone().unwrap_or_else(|| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "kestrel".to_string())
        })
    }
}

/// Connection pool sizing
///
/// `max_connections / connections_per_thread` thread-slots exist for the
/// lifetime of the process, each with one worker and one command queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub connections_per_thread: usize,
    /// Initial capacity of every thread-slot command queue
    pub queue_capacity: usize,
    /// Double the queue capacity instead of rejecting a push when full
    pub queue_grow_on_demand: bool,
    /// Frames buffered per connection between the workers and its writer
    pub outbound_channel_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 32,
            connections_per_thread: 4,
            queue_capacity: 64,
            queue_grow_on_demand: true,
            outbound_channel_size: 256,
        }
    }
}

impl PoolConfig {
    pub fn thread_slots(&self) -> usize {
        self.max_connections / self.connections_per_thread.max(1)
    }
}

/// Inbound command framing
///
/// A command ends with `terminator_len` consecutive LF bytes. An
/// unterminated accumulator larger than `max_frame_bytes` is dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FramingConfig {
    pub terminator_len: usize,
    pub max_frame_bytes: usize,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            terminator_len: 3,
            max_frame_bytes: 2048,
        }
    }
}

/// Repair lock expiry
///
/// The lock is released after `expiry_ticks` ticks of `tick_interval_ms`
/// without a renewing request from the holder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairLockConfig {
    pub tick_interval_ms: u64,
    pub expiry_ticks: u32,
}

impl Default for RepairLockConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 12_000,
            expiry_ticks: 5,
        }
    }
}

impl RepairLockConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Time after which an unrenewed lock is released.
    pub fn expiry(&self) -> Duration {
        self.tick_interval() * self.expiry_ticks
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
    /// Emit structured audit events for connections, questions and the repair lock
    pub audit_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: Some(PathBuf::from("/var/log/kestrel/station.log")),
            audit_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text logging for human readability
    Text,
    /// One JSON object per line for log aggregators
    Json,
}

pub fn load_config(path: &std::path::Path) -> Result<StationConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: StationConfig = toml::from_str(&contents).map_err(|e| {
        StationError::Config(format!("Invalid config file {}: {}", path.display(), e))
    })?;
    Ok(config)
}

pub fn write_config(path: &std::path::Path, config: &StationConfig) -> Result<()> {
    let contents = toml::to_string_pretty(config)
        .map_err(|e| StationError::Config(format!("Failed to serialize config: {}", e)))?;
    std::fs::write(path, contents)?;
    Ok(())
}

/// Validate the station configuration
///
/// `validate_bind` additionally checks that the discovery port is free.
pub fn validate_config(config: &StationConfig, validate_bind: bool) -> Result<()> {
    if !config.log_dir.is_absolute() {
        return Err(StationError::Config(
            "log_dir must be an absolute path".to_string(),
        ));
    }

    match std::fs::metadata(&config.log_dir) {
        Ok(meta) => {
            if !meta.is_dir() {
                return Err(StationError::Config(
                    "log_dir must be a directory".to_string(),
                ));
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StationError::Config(
                "log_dir does not exist; create it or adjust config".to_string(),
            ));
        }
        Err(e) => return Err(StationError::Io(e)),
    }

    if config.discovery_port == 0 || config.tcp_base_port == 0 {
        return Err(StationError::Config(
            "discovery_port and tcp_base_port must be non-zero".to_string(),
        ));
    }

    if config.tcp_port_scan_limit == 0 {
        return Err(StationError::Config(
            "tcp_port_scan_limit must be at least 1".to_string(),
        ));
    }

    if validate_bind
        && let Err(e) = std::net::UdpSocket::bind((config.bind_ip, config.discovery_port))
    {
        return Err(StationError::Config(format!(
            "discovery_port is not available: {}",
            e
        )));
    }

    validate_pool_config(&config.pool)?;
    validate_framing_config(&config.framing)?;

    if config.repair_lock.tick_interval_ms == 0 || config.repair_lock.expiry_ticks == 0 {
        return Err(StationError::Config(
            "repair_lock tick_interval_ms and expiry_ticks must be non-zero".to_string(),
        ));
    }

    if let Some(ref log_file) = config.logging.file {
        let parent = log_file.parent().ok_or_else(|| {
            StationError::Config("logging.file must include a parent directory".to_string())
        })?;
        match std::fs::metadata(parent) {
            Ok(meta) => {
                if !meta.is_dir() {
                    return Err(StationError::Config(
                        "logging.file parent must be a directory".to_string(),
                    ));
                }
            }
            Err(e) => {
                return Err(StationError::Config(format!(
                    "logging.file parent error: {}",
                    e
                )));
            }
        }
        let _ = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .map_err(|e| StationError::Config(format!("logging.file not writable: {}", e)))?;
    }

    Ok(())
}

pub fn validate_pool_config(pool: &PoolConfig) -> Result<()> {
    if pool.connections_per_thread == 0 || pool.max_connections == 0 {
        return Err(StationError::Config(
            "max_connections and connections_per_thread must be non-zero".to_string(),
        ));
    }

    if pool.max_connections % pool.connections_per_thread != 0 {
        return Err(StationError::Config(format!(
            "max_connections ({}) must be a multiple of connections_per_thread ({})",
            pool.max_connections, pool.connections_per_thread
        )));
    }

    if pool.queue_capacity == 0 {
        return Err(StationError::Config(
            "queue_capacity must be non-zero".to_string(),
        ));
    }

    if pool.outbound_channel_size == 0 {
        return Err(StationError::Config(
            "outbound_channel_size must be non-zero".to_string(),
        ));
    }

    Ok(())
}

pub fn validate_framing_config(framing: &FramingConfig) -> Result<()> {
    if framing.terminator_len == 0 {
        return Err(StationError::Config(
            "framing.terminator_len must be at least 1".to_string(),
        ));
    }

    if framing.max_frame_bytes <= framing.terminator_len {
        return Err(StationError::Config(
            "framing.max_frame_bytes must exceed terminator_len".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::field_reassign_with_default)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> std::io::Result<PathBuf> {
        let mut dir = std::env::temp_dir();
        dir.push(format!("kestrel_station_test_{}_{}", name, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn base_config(name: &str) -> std::io::Result<StationConfig> {
        let mut config = StationConfig::default();
        config.log_dir = temp_dir(name)?;
        config.logging.file = Some(temp_dir(&format!("{name}_log"))?.join("station.log"));
        Ok(config)
    }

    #[test]
    fn parses_minimal_toml() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let log_dir = temp_dir("parse")?;
        let toml = format!(
            r#"
log_dir = "{}"
discovery_port = 6150

[pool]
max_connections = 8
connections_per_thread = 2

[logging]
file = "{}/station.log"
"#,
            log_dir.display(),
            log_dir.display()
        );
        let config: StationConfig = toml::from_str(&toml)?;
        assert_eq!(config.pool.thread_slots(), 4);
        assert_eq!(config.framing.max_frame_bytes, 2048);
        assert_eq!(config.repair_lock.expiry_ticks, 5);
        validate_config(&config, false)?;
        Ok(())
    }

    #[test]
    fn rejects_relative_log_dir() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut config = base_config("relative")?;
        config.log_dir = PathBuf::from("relative/path");
        match validate_config(&config, false) {
            Ok(()) => return Err("expected error for relative log_dir".into()),
            Err(err) => assert!(format!("{err}").contains("log_dir must be an absolute path")),
        }
        Ok(())
    }

    #[test]
    fn rejects_missing_log_dir() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut config = base_config("missing")?;
        config.log_dir = PathBuf::from("/nonexistent/kestrel-logs");
        match validate_config(&config, false) {
            Ok(()) => return Err("expected error for missing log_dir".into()),
            Err(err) => assert!(format!("{err}").contains("log_dir does not exist")),
        }
        Ok(())
    }

    #[test]
    fn rejects_uneven_pool() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut config = base_config("uneven")?;
        config.pool.max_connections = 10;
        config.pool.connections_per_thread = 4;
        match validate_config(&config, false) {
            Ok(()) => return Err("expected error for uneven pool".into()),
            Err(err) => assert!(format!("{err}").contains("must be a multiple")),
        }
        Ok(())
    }

    #[test]
    fn rejects_zero_queue_capacity() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut config = base_config("zero_queue")?;
        config.pool.queue_capacity = 0;
        match validate_config(&config, false) {
            Ok(()) => return Err("expected error for zero queue capacity".into()),
            Err(err) => assert!(format!("{err}").contains("queue_capacity")),
        }
        Ok(())
    }

    #[test]
    fn rejects_zero_ports() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut config = base_config("ports")?;
        config.discovery_port = 0;
        match validate_config(&config, false) {
            Ok(()) => return Err("expected error for zero discovery port".into()),
            Err(err) => assert!(format!("{err}").contains("must be non-zero")),
        }
        Ok(())
    }

    #[test]
    fn rejects_degenerate_framing() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut config = base_config("framing")?;
        config.framing.max_frame_bytes = 3;
        match validate_config(&config, false) {
            Ok(()) => return Err("expected error for tiny max_frame_bytes".into()),
            Err(err) => assert!(format!("{err}").contains("max_frame_bytes")),
        }

        config.framing = FramingConfig {
            terminator_len: 0,
            max_frame_bytes: 2048,
        };
        assert!(validate_config(&config, false).is_err());
        Ok(())
    }

    #[test]
    fn rejects_zero_repair_ticks() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut config = base_config("ticks")?;
        config.repair_lock.expiry_ticks = 0;
        match validate_config(&config, false) {
            Ok(()) => return Err("expected error for zero expiry ticks".into()),
            Err(err) => assert!(format!("{err}").contains("repair_lock")),
        }
        Ok(())
    }

    #[test]
    fn rejects_logging_file_with_missing_parent()
    -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut config = base_config("logfile")?;
        config.logging.file = Some(PathBuf::from("/nonexistent/kestrel/station.log"));
        match validate_config(&config, false) {
            Ok(()) => return Err("expected error for logging.file parent".into()),
            Err(err) => assert!(format!("{err}").contains("logging.file parent error")),
        }
        Ok(())
    }

    #[test]
    fn rejects_discovery_port_in_use() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0")?;
        let port = socket.local_addr()?.port();

        let mut config = base_config("bind_in_use")?;
        config.bind_ip = "127.0.0.1".parse()?;
        config.discovery_port = port;
        match validate_config(&config, true) {
            Ok(()) => return Err("expected error for discovery port in use".into()),
            Err(err) => assert!(format!("{err}").contains("discovery_port is not available")),
        }
        Ok(())
    }

    #[test]
    fn repair_expiry_is_ticks_times_interval() {
        let lock = RepairLockConfig {
            tick_interval_ms: 200,
            expiry_ticks: 5,
        };
        assert_eq!(lock.expiry(), Duration::from_millis(1000));
    }

    #[test]
    fn config_round_trips_through_file() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = temp_dir("roundtrip")?;
        let path = dir.join("station.toml");
        let mut config = base_config("roundtrip_cfg")?;
        config.pool.queue_capacity = 7;
        write_config(&path, &config)?;
        let loaded = load_config(&path)?;
        assert_eq!(loaded.pool.queue_capacity, 7);
        assert_eq!(loaded.log_dir, config.log_dir);
        Ok(())
    }
}
