//! Configuration file support for yunflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (YUNFLASH_*)
//! 3. Local config file (./yunflash.toml)
//! 4. Global config file (~/.config/yunflash/config.toml)

use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

/// Name of the local configuration file.
pub const LOCAL_CONFIG: &str = "yunflash.toml";

/// Locations of the bundled firmware and tools.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory served over TFTP.
    pub tftp_dir: Option<PathBuf>,
    /// Directory holding `bin/avrdude`, `etc/avrdude.conf` and the MCU hex files.
    pub avr_dir: Option<PathBuf>,
}

/// Board settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BoardConfig {
    /// Board identifier stored in the bootloader environment.
    pub target: Option<String>,
    /// Always flash the bootloader.
    #[serde(default)]
    pub flash_bootloader: bool,
}

/// Network settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Address of this machine.
    pub server_ip: Option<Ipv4Addr>,
    /// Address for the board.
    pub board_ip: Option<Ipv4Addr>,
    /// TCP port used to probe for a free board address.
    pub probe_port: Option<u16>,
}

/// Serial settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Preferred serial port (e.g., "/dev/ttyACM0" or "COM3").
    pub port: Option<String>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Firmware and tool locations.
    #[serde(default)]
    pub paths: PathsConfig,
    /// Board settings.
    #[serde(default)]
    pub board: BoardConfig,
    /// Network settings.
    #[serde(default)]
    pub network: NetworkConfig,
    /// Serial settings.
    #[serde(default)]
    pub serial: SerialConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "yunflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        if other.paths.tftp_dir.is_some() {
            self.paths.tftp_dir = other.paths.tftp_dir;
        }
        if other.paths.avr_dir.is_some() {
            self.paths.avr_dir = other.paths.avr_dir;
        }

        if other.board.target.is_some() {
            self.board.target = other.board.target;
        }
        if other.board.flash_bootloader {
            self.board.flash_bootloader = true;
        }

        if other.network.server_ip.is_some() {
            self.network.server_ip = other.network.server_ip;
        }
        if other.network.board_ip.is_some() {
            self.network.board_ip = other.network.board_ip;
        }
        if other.network.probe_port.is_some() {
            self.network.probe_port = other.network.probe_port;
        }

        if other.serial.port.is_some() {
            self.serial.port = other.serial.port;
        }
    }
}

/// Directory of the running executable, where the firmware bundle lives by default.
pub fn bundle_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}
