//! Application processor flashing through the bootloader console.
//!
//! The board's bootloader is driven as a text shell: stop autoboot, point its
//! network environment at the host, pull images over TFTP and copy them to
//! flash. [`script`] holds the console scripts as data, [`flasher`] sequences
//! them.

pub mod flasher;
pub mod script;

use std::fmt;
use std::time::Duration;

pub use flasher::MpuFlasher;
pub use script::BootBanner;

use crate::error::Error;

/// Maximum number of network setup attempts within one flashing run.
pub const MAX_NETWORK_ATTEMPTS: usize = 4;

/// Stages of a flashing run, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Reboot the running Linux shell, if any.
    AwaitShellBoot,
    /// Read the autoboot banner.
    DetectBootStopKeyword,
    /// Stop autoboot and read the bootloader prompt.
    DetectShellPrompt,
    /// Replace the bootloader.
    FlashBootloader,
    /// Set and check the bootloader network environment.
    ConfigureNetwork,
    /// Transfer the system image and write it to flash.
    TransferAndWriteImage,
    /// Control was handed to Linux.
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AwaitShellBoot => "reboot",
            Self::DetectBootStopKeyword => "bootloader detection",
            Self::DetectShellPrompt => "bootloader prompt",
            Self::FlashBootloader => "bootloader flash",
            Self::ConfigureNetwork => "network setup",
            Self::TransferAndWriteImage => "image flash",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// Delays and batch deadlines of a flashing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// Deadline to reach the Linux shell and reboot it.
    pub shell: Duration,
    /// Deadline for the autoboot banner.
    pub banner: Duration,
    /// Deadline for the bootloader prompt.
    pub prompt: Duration,
    /// Deadline of one network setup attempt.
    pub network: Duration,
    /// Deadline of the bootloader transfer and of its write.
    pub bootloader: Duration,
    /// Deadline to get the new bootloader's prompt back.
    pub resync: Duration,
    /// Deadline of the image transfer and of its write.
    pub image: Duration,
    /// Pause before any TFTP transfer.
    pub transfer_settle: Duration,
    /// Pause after resetting into the new bootloader.
    pub reset_settle: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            shell: Duration::from_secs(5),
            banner: Duration::from_secs(20),
            prompt: Duration::from_secs(5),
            network: Duration::from_secs(10),
            bootloader: Duration::from_secs(30),
            resync: Duration::from_secs(10),
            image: Duration::from_secs(90),
            transfer_settle: Duration::from_secs(2),
            reset_settle: Duration::from_secs(1),
        }
    }
}

/// A flashing run that stopped.
#[derive(Debug, thiserror::Error)]
#[error("{stage} failed: {source}")]
pub struct FlashFailure {
    /// Stage that was running.
    pub stage: Stage,
    /// Console output of the failing step.
    pub transcript: String,
    /// Underlying error.
    #[source]
    pub source: Error,
}

impl FlashFailure {
    /// Whether another end-to-end attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        self.source
            .is_retryable()
    }
}
