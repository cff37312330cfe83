use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Configuration for the OmniVault backup hub.
///
/// This structure defines all the configurable parameters for the service:
/// network settings, the embedded database location, the NBD data plane
/// (port pool and kernel device pool), restore-mount behavior and the
/// capture-agent endpoint. It supports serialization to and deserialization
/// from JSON for persistent configuration.
///
/// The configuration can be loaded from a file or generated with default
/// values if no configuration file exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// The port number on which the control API will listen
    pub port: u16,

    /// The IP address to which the control API will bind
    pub address: String,

    /// Path of the embedded SQLite database file
    pub database_path: String,

    /// Shared secret used to validate API bearer tokens (HS256)
    pub auth_secret: String,

    /// Lifetime of issued API tokens, in hours
    pub token_expiry_hours: i64,

    /// Base URL of the hypervisor-side capture agent
    pub agent_url: String,

    /// Base URL the capture agent uses to call back into this service
    pub callback_base_url: String,

    /// Inclusive lower bound of the NBD export port pool
    pub nbd_port_min: u16,

    /// Exclusive upper bound of the NBD export port pool
    pub nbd_port_max: u16,

    /// Path of the qemu-nbd binary used for exports and restore mounts
    pub qemu_nbd_binary: String,

    /// Path of the qemu-img binary used by the image driver
    pub qemu_img_binary: String,

    /// Directory where image-server PID files are written
    pub pid_dir: String,

    /// Root directory under which restore mounts are created
    pub restore_mount_root: String,

    /// Number of kernel NBD devices available for restore mounts (/dev/nbd0..N-1)
    pub restore_device_count: u32,

    /// Restore mount lifetime in minutes before forced expiry
    pub restore_mount_ttl_minutes: i64,

    /// Restore mount idle timeout in minutes
    pub restore_idle_timeout_minutes: i64,

    /// Interval in seconds between restore-mount cleanup sweeps
    pub restore_cleanup_interval_secs: u64,

    /// Interval in seconds between immutability-flag sweeps
    pub retention_sweep_interval_secs: u64,

    /// Wall-clock bound in minutes after which an unresponsive backup job is failed
    pub job_timeout_minutes: i64,
}

/// Default implementation for ServerConfig.
///
/// Provides reasonable default values for a single-appliance deployment,
/// used when no custom configuration is provided or when initializing a new
/// configuration file.
impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8400,
            address: "0.0.0.0".to_string(),
            database_path: "omni-vault.db".to_string(),
            auth_secret: "change-me".to_string(),
            token_expiry_hours: 24,
            agent_url: "http://localhost:9081".to_string(),
            callback_base_url: "http://localhost:8400".to_string(),
            nbd_port_min: 10100,
            nbd_port_max: 10200,
            qemu_nbd_binary: "qemu-nbd".to_string(),
            qemu_img_binary: "qemu-img".to_string(),
            pid_dir: "/run/omni-vault".to_string(),
            restore_mount_root: "/mnt/omni-vault/restore".to_string(),
            restore_device_count: 8,
            restore_mount_ttl_minutes: 60,
            restore_idle_timeout_minutes: 30,
            restore_cleanup_interval_secs: 300,
            retention_sweep_interval_secs: 3600,
            job_timeout_minutes: 240,
        }
    }
}

/// Possible errors that can occur during configuration operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConfigError {
    /// Indicates that the configuration file could not be found
    FileNotFound,

    /// Indicates that writing to the configuration file failed
    FailedToWrite,

    /// Indicates that parsing the configuration file content failed
    ParseError,
}

/// Global static reference to the server configuration.
///
/// This lazy_static provides thread-safe access to the server configuration
/// throughout the application. It is initialized when first accessed,
/// reading from the configuration file or creating default settings if
/// no configuration exists.
///
/// # Panics
///
/// Panics if the configuration cannot be read or written, which would
/// prevent the server from starting properly.
lazy_static! {
    pub static ref SERVER_CONFIG: Arc<ServerConfig> =
        Arc::new(ServerConfig::read().expect("Failed to initialize server config"));
}

impl ServerConfig {
    /// Reads the server configuration from the config file.
    ///
    /// Attempts to load the configuration from the path in the
    /// `OMNI_VAULT_CONFIG` environment variable, falling back to
    /// "config.json" in the current directory. If the file doesn't exist or
    /// can't be read, it creates a new configuration file with default
    /// values and returns those defaults.
    pub fn read() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("OMNI_VAULT_CONFIG").unwrap_or_else(|_| "config.json".to_string());
        let config_content = match std::fs::read_to_string(&config_path) {
            Ok(content) => content,
            Err(_) => {
                // If file doesn't exist, create a default configuration
                Self::write_default().expect("Failed to write default config");
                return Ok(ServerConfig::default());
            }
        };

        let config: ServerConfig = match serde_json::from_str(&config_content) {
            Ok(config) => config,
            Err(_) => return Err(ConfigError::ParseError),
        };

        Ok(config)
    }

    /// Writes the current configuration to the config file.
    pub fn write(&self) -> Result<(), ConfigError> {
        let config_path =
            std::env::var("OMNI_VAULT_CONFIG").unwrap_or_else(|_| "config.json".to_string());

        let config_content = match serde_json::to_string_pretty(&self) {
            Ok(content) => content,
            Err(_) => return Err(ConfigError::ParseError),
        };

        match std::fs::write(config_path, config_content) {
            Ok(_) => Ok(()),
            Err(_) => Err(ConfigError::FailedToWrite),
        }
    }

    /// Creates and writes a default configuration to the config file.
    pub fn write_default() -> Result<(), ConfigError> {
        let config = ServerConfig::default();
        config.write()
    }

    /// The half-open NBD export port range `[nbd_port_min, nbd_port_max)`.
    pub fn nbd_port_range(&self) -> std::ops::Range<u16> {
        self.nbd_port_min..self.nbd_port_max
    }
}
