//! Run-scoped provisioning state.

use std::net::Ipv4Addr;
use std::path::Path;

use crate::error::{Error, Result};

/// Bootloader image served to the board.
pub const BOOTLOADER_IMAGE: &str = "u-boot-arduino-lede.bin";

/// Operating system upgrade image served to the board.
pub const SYSUPGRADE_IMAGE: &str = "openwrt-ar71xx-generic-arduino-yun-squashfs-sysupgrade.bin";

/// A firmware file with its exact size.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Artifact {
    /// File name as requested over TFTP.
    pub name: String,
    /// Exact size in bytes.
    pub size: u64,
}

impl Artifact {
    /// Create an artifact description.
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }

    /// Size an artifact served from `dir`.
    pub fn from_dir(dir: &Path, name: &str) -> Result<Self> {
        let path = dir.join(name);
        let metadata = std::fs::metadata(&path).map_err(|e| {
            Error::Config(format!("cannot read artifact {}: {e}", path.display()))
        })?;
        if !metadata.is_file() {
            return Err(Error::Config(format!("{} is not a file", path.display())));
        }
        Ok(Self::new(name, metadata.len()))
    }

    /// Check the byte count reported by the bootloader against the file size.
    pub fn verify_transfer(&self, reported: u64) -> Result<()> {
        if reported == self.size {
            Ok(())
        } else {
            Err(Error::TransferSizeMismatch {
                artifact: self.name.clone(),
                expected: self.size,
                actual: reported,
            })
        }
    }
}

/// State of one provisioning attempt.
///
/// The context is never mutated in place: renegotiated addresses or an
/// escalated bootloader flag produce a new value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashContext {
    /// Address of this machine (TFTP server).
    pub server_addr: Ipv4Addr,
    /// Address the board should use.
    pub board_addr: Ipv4Addr,
    /// Whether the bootloader is flashed as well.
    pub flash_bootloader: bool,
    /// Board identifier stored in the bootloader environment.
    pub target_board: String,
    /// Bootloader image.
    pub bootloader: Artifact,
    /// Operating system upgrade image.
    pub sysupgrade: Artifact,
}

impl FlashContext {
    /// Same context with new addresses.
    #[must_use]
    pub fn with_addresses(self, server_addr: Ipv4Addr, board_addr: Ipv4Addr) -> Self {
        Self {
            server_addr,
            board_addr,
            ..self
        }
    }

    /// Same context with the bootloader flag forced on.
    #[must_use]
    pub fn with_bootloader_flash(self) -> Self {
        Self {
            flash_bootloader: true,
            ..self
        }
    }
}
