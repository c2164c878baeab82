//! Load config from file and environment.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use nearfile_core::dedup::DedupPolicy;
use nearfile_core::frame::{CHUNK_INDEX_LEN, MAX_PAYLOAD_LEN};
use nearfile_core::message::{FileData, MAX_DATAGRAM_LEN};
use nearfile_core::{Checksum, Message, TransferIdGenerator, DEFAULT_CHUNK_SIZE, RADIO_CHUNK_SIZE};
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Node configuration. File: ~/.config/nearfile/config.toml or /etc/nearfile/config.toml.
/// Env overrides: NEARFILE_DEVICE_NAME, NEARFILE_BASE_PORT, NEARFILE_BROADCAST_ADDR,
/// NEARFILE_DOWNLOAD_DIR.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Name shown to other devices.
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// First control port tried (default 40000).
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    /// Ports tried upward from `base_port` before giving up (default 10).
    #[serde(default = "default_port_attempts")]
    pub port_attempts: u16,
    /// Data socket window starts this far above the control port (default 1000).
    #[serde(default = "default_data_port_offset")]
    pub data_port_offset: u16,
    #[serde(default = "default_broadcast_addr")]
    pub broadcast_addr: IpAddr,
    /// Datagram-link chunk size in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u32,
    /// Radio-link chunk size in bytes.
    #[serde(default = "default_radio_chunk_size")]
    pub radio_chunk_size: u32,
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Forget unconnected peers not heard from for this long. Unset keeps them for the session.
    #[serde(default)]
    pub peer_ttl_secs: Option<u64>,
    #[serde(default)]
    pub timing: Timings,
}

/// Protocol timers, in milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Timings {
    pub discovery_interval: u64,
    pub pairing_timeout: u64,
    pub warmup: u64,
    pub start_ack_timeout: u64,
    pub confirm_timeout: u64,
    pub radio_write_backoff: u64,
    pub ack_spacing: u64,
    pub reconnect_interval: u64,
    pub duplicate_window: u64,
    pub same_file_window: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            discovery_interval: 3000,
            pairing_timeout: 60_000,
            warmup: 1000,
            start_ack_timeout: 6000,
            confirm_timeout: 10_000,
            radio_write_backoff: 300,
            ack_spacing: 100,
            reconnect_interval: 2000,
            duplicate_window: 30_000,
            same_file_window: 2000,
        }
    }
}

impl Timings {
    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval)
    }
    pub fn pairing_timeout(&self) -> Duration {
        Duration::from_millis(self.pairing_timeout)
    }
    pub fn warmup(&self) -> Duration {
        Duration::from_millis(self.warmup)
    }
    pub fn start_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.start_ack_timeout)
    }
    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout)
    }
    pub fn radio_write_backoff(&self) -> Duration {
        Duration::from_millis(self.radio_write_backoff)
    }
    pub fn ack_spacing(&self) -> Duration {
        Duration::from_millis(self.ack_spacing)
    }
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval)
    }

    pub fn dedup_policy(&self) -> DedupPolicy {
        DedupPolicy {
            completed_ttl: Duration::from_millis(self.duplicate_window),
            same_file_window: Duration::from_millis(self.same_file_window),
        }
    }
}

fn default_device_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "nearfile".to_string())
}
fn default_base_port() -> u16 {
    40000
}
fn default_port_attempts() -> u16 {
    10
}
fn default_data_port_offset() -> u16 {
    1000
}
fn default_broadcast_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::BROADCAST)
}
fn default_chunk_size() -> u32 {
    DEFAULT_CHUNK_SIZE
}
fn default_radio_chunk_size() -> u32 {
    RADIO_CHUNK_SIZE
}
fn default_download_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(h) => PathBuf::from(h).join("Downloads/nearfile"),
        None => PathBuf::from("received"),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            base_port: default_base_port(),
            port_attempts: default_port_attempts(),
            data_port_offset: default_data_port_offset(),
            broadcast_addr: default_broadcast_addr(),
            chunk_size: default_chunk_size(),
            radio_chunk_size: default_radio_chunk_size(),
            download_dir: default_download_dir(),
            peer_ttl_secs: None,
            timing: Timings::default(),
        }
    }
}

impl Config {
    pub fn from_toml(s: &str) -> Result<Config, ConfigError> {
        let c: Config = toml::from_str(s)?;
        c.validate()?;
        Ok(c)
    }

    /// Reject settings no transfer could work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port_attempts == 0 {
            return Err(ConfigError::Invalid("port_attempts must be at least 1".into()));
        }
        if self.data_port_offset < self.port_attempts {
            return Err(ConfigError::Invalid(format!(
                "data_port_offset {} overlaps the {}-port control window",
                self.data_port_offset, self.port_attempts
            )));
        }
        if self.chunk_size == 0 || !fits_in_datagram(self.chunk_size) {
            return Err(ConfigError::Invalid(format!(
                "chunk_size {} does not fit in one datagram",
                self.chunk_size
            )));
        }
        let radio_max = (MAX_PAYLOAD_LEN - CHUNK_INDEX_LEN) as u32;
        if self.radio_chunk_size == 0 || self.radio_chunk_size > radio_max {
            return Err(ConfigError::Invalid(format!(
                "radio_chunk_size must be 1..={radio_max}, got {}",
                self.radio_chunk_size
            )));
        }
        Ok(())
    }

    pub fn peer_ttl(&self) -> Option<Duration> {
        self.peer_ttl_secs.map(Duration::from_secs)
    }

    /// Apply overrides from `lookup` (normally the process environment).
    /// Unparseable values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(s) = lookup("NEARFILE_DEVICE_NAME") {
            if !s.trim().is_empty() {
                self.device_name = s.trim().to_string();
            }
        }
        if let Some(s) = lookup("NEARFILE_BASE_PORT") {
            if let Ok(p) = s.parse::<u16>() {
                self.base_port = p;
            }
        }
        if let Some(s) = lookup("NEARFILE_BROADCAST_ADDR") {
            if let Ok(a) = s.parse::<IpAddr>() {
                self.broadcast_addr = a;
            }
        }
        if let Some(s) = lookup("NEARFILE_DOWNLOAD_DIR") {
            if !s.is_empty() {
                self.download_dir = PathBuf::from(s);
            }
        }
    }
}

/// Whether the largest FILE_DATA for `chunk_size` bytes still fits one UDP datagram.
fn fits_in_datagram(chunk_size: u32) -> bool {
    if chunk_size as usize >= MAX_DATAGRAM_LEN {
        return false;
    }
    let largest = Message::FileData(FileData {
        transfer_id: TransferIdGenerator::new().next_at(u64::MAX),
        chunk_index: u32::MAX,
        data: vec![0xff; chunk_size as usize],
        checksum: Some(Checksum::of(&[])),
        timestamp: u64::MAX,
    });
    largest
        .encode()
        .is_ok_and(|bytes| bytes.len() <= MAX_DATAGRAM_LEN)
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    c.apply_env(|k| std::env::var(k).ok());
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/nearfile/config.toml"));
    }
    out.push(PathBuf::from("/etc/nearfile/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match Config::from_toml(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => tracing::warn!(path = %p.display(), error = %e, "ignoring invalid config file"),
                },
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "cannot read config file"),
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_yields_defaults() {
        let c = Config::from_toml("").unwrap();
        assert_eq!(c.base_port, 40000);
        assert_eq!(c.port_attempts, 10);
        assert_eq!(c.data_port_offset, 1000);
        assert_eq!(c.chunk_size, 48_000);
        assert_eq!(c.radio_chunk_size, 20);
        assert_eq!(c.broadcast_addr, IpAddr::V4(Ipv4Addr::BROADCAST));
        assert_eq!(c.timing.discovery_interval(), Duration::from_secs(3));
        assert!(c.peer_ttl().is_none());
    }

    #[test]
    fn partial_timing_table_keeps_other_defaults() {
        let c = Config::from_toml(
            r#"
            device_name = "desk"
            broadcast_addr = "192.168.1.255"
            [timing]
            warmup = 10
            "#,
        )
        .unwrap();
        assert_eq!(c.device_name, "desk");
        assert_eq!(c.broadcast_addr, "192.168.1.255".parse::<IpAddr>().unwrap());
        assert_eq!(c.timing.warmup(), Duration::from_millis(10));
        assert_eq!(c.timing.confirm_timeout(), Duration::from_secs(10));
        assert_eq!(
            c.timing.dedup_policy().completed_ttl,
            Duration::from_secs(30)
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(Config::from_toml("proxy_port = 3128").is_err());
    }

    #[test]
    fn chunk_sizes_must_fit_their_link() {
        for bad in ["chunk_size = 0", "chunk_size = 60000", "radio_chunk_size = 0", "radio_chunk_size = 65535"] {
            assert!(
                matches!(Config::from_toml(bad), Err(ConfigError::Invalid(_))),
                "{bad} was accepted"
            );
        }
        assert_eq!(Config::from_toml("chunk_size = 1200").unwrap().chunk_size, 1200);
        assert_eq!(
            Config::from_toml("radio_chunk_size = 65533").unwrap().radio_chunk_size,
            65533
        );
    }

    #[test]
    fn port_windows_must_be_usable() {
        assert!(matches!(
            Config::from_toml("port_attempts = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::from_toml("port_attempts = 20\ndata_port_offset = 10"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::from_toml("base_port = \"high\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn env_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            ("NEARFILE_BASE_PORT", "41000"),
            ("NEARFILE_BROADCAST_ADDR", "127.0.0.1"),
            ("NEARFILE_DEVICE_NAME", "laptop"),
            ("NEARFILE_DOWNLOAD_DIR", "/tmp/in"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        c.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.base_port, 41000);
        assert_eq!(c.broadcast_addr, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(c.device_name, "laptop");
        assert_eq!(c.download_dir, PathBuf::from("/tmp/in"));
    }

    #[test]
    fn bad_env_values_are_ignored() {
        let mut c = Config::default();
        c.apply_env(|k| (k == "NEARFILE_BASE_PORT").then(|| "not-a-port".to_string()));
        assert_eq!(c.base_port, 40000);
    }
}
