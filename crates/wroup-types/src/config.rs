//! Configuration loading from `~/.wroup/config.toml` with defaults.

use crate::peer::Peer;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Default TCP port a group owner accepts links on.
pub const DEFAULT_PORT: u16 = 9999;

/// Default mDNS service type.
pub const DEFAULT_SERVICE_TYPE: &str = "_wroup._tcp.local.";

/// Maximum single frame size (16 MB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Envelopes queued per link before the link counts as stalled.
pub const DEFAULT_LINK_QUEUE_CAPACITY: usize = 1024;

/// Device-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WroupConfig {
    /// Name this device reports to peers.
    pub device_name: String,
    /// Hardware address this device reports to peers.
    pub hardware_address: String,
    /// Address the group owner listens on.
    pub listen_addr: SocketAddr,
    /// mDNS service type used for advertisement and browsing.
    pub service_type: String,
    /// Upper bound on a single discovery round.
    pub discovery_timeout_ms: u64,
    /// Upper bound on establishing a peer link.
    pub connect_timeout_ms: u64,
    /// Frames larger than this are rejected.
    pub max_frame_size: u32,
    /// Capacity of each event channel.
    pub event_capacity: usize,
    /// Outbound envelopes queued per link; a full queue drops the link.
    pub link_queue_capacity: usize,
}

impl Default for WroupConfig {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            hardware_address: random_hardware_address(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            service_type: DEFAULT_SERVICE_TYPE.to_string(),
            discovery_timeout_ms: 10_000,
            connect_timeout_ms: 2_000,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            event_capacity: 256,
            link_queue_capacity: DEFAULT_LINK_QUEUE_CAPACITY,
        }
    }
}

impl WroupConfig {
    /// The local device as a peer (endpoint unset).
    pub fn local_peer(&self) -> Peer {
        Peer::new(self.device_name.clone(), self.hardware_address.clone())
    }

    /// Discovery round timeout.
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    /// Link establishment timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn default_device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "wroup-device".to_string())
}

/// A random locally administered, unicast MAC-style address.
pub fn random_hardware_address() -> String {
    let mut bytes: [u8; 6] = rand::random();
    bytes[0] = (bytes[0] | 0x02) & 0xfe;
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Default config file location.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".wroup")
        .join("config.toml")
}

/// Load configuration from a TOML file, with defaults.
///
/// Missing or unreadable files fall back to [`WroupConfig::default`].
pub fn load_config(path: Option<&Path>) -> WroupConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return WroupConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<WroupConfig>(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
                WroupConfig::default()
            }
        },
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            WroupConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = WroupConfig::default();
        assert_eq!(config.listen_addr.port(), DEFAULT_PORT);
        assert_eq!(config.connect_timeout(), Duration::from_secs(2));
        assert_eq!(config.service_type, DEFAULT_SERVICE_TYPE);
        assert!(!config.device_name.is_empty());
    }

    #[test]
    fn test_random_hardware_address_shape() {
        let addr = random_hardware_address();
        let parts: Vec<_> = addr.split(':').collect();
        assert_eq!(parts.len(), 6);
        let first = u8::from_str_radix(parts[0], 16).unwrap();
        assert_eq!(first & 0x02, 0x02);
        assert_eq!(first & 0x01, 0);
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "device_name = \"den-tablet\"\nhardware_address = \"02:00:00:00:00:01\"\ndiscovery_timeout_ms = 500"
        )
        .unwrap();
        let config = load_config(Some(file.path()));
        assert_eq!(config.device_name, "den-tablet");
        assert_eq!(config.discovery_timeout(), Duration::from_millis(500));
        assert_eq!(config.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
        assert_eq!(config.link_queue_capacity, DEFAULT_LINK_QUEUE_CAPACITY);
        assert_eq!(
            config.local_peer(),
            Peer::new("den-tablet", "02:00:00:00:00:01")
        );
    }

    #[test]
    fn test_load_missing_or_invalid_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let missing = load_config(Some(&dir.path().join("nope.toml")));
        assert_eq!(missing.listen_addr.port(), DEFAULT_PORT);

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "listen_addr = 42").unwrap();
        let config = load_config(Some(&bad));
        assert_eq!(config.listen_addr.port(), DEFAULT_PORT);
    }
}
