//! # yunflash
//!
//! A library for reflashing dual-processor boards (an AVR microcontroller
//! bridged to a Linux application processor, like the Arduino Yún) over USB
//! serial and TFTP.
//!
//! The crate provides:
//!
//! - Serial port discovery and tracking across USB re-enumeration
//! - A send/expect console automaton with deadlines
//! - Bootloader scripts that flash the bootloader and system image
//! - Host/board address negotiation
//! - A read-only TFTP server
//! - MCU sketch uploads through `avrdude`
//!
//! ## Features
//!
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use yunflash::{Progress, Provisioner, RunOptions};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = RunOptions {
//!         tftp_dir: "tftp".into(),
//!         avr_dir: "avr".into(),
//!         ..RunOptions::default()
//!     };
//!
//!     let mut sink = |progress: &Progress| println!("{progress:?}");
//!     let summary = Provisioner::new(options, &mut sink).run()?;
//!     println!("Board ready on {}", summary.port);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod console;
pub mod context;
pub mod device;
pub mod error;
pub mod mcu;
pub mod mpu;
pub mod netconf;
pub mod port;
pub mod provision;
pub mod tftp;
pub mod watcher;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications).
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

pub use {
    console::{BatchError, ConsoleSession, SessionState, Step, StepResult},
    context::{Artifact, FlashContext},
    device::{BoardKind, SerialEndpoint, find_flashing_port, list_endpoints, list_port_names},
    error::{Error, Result},
    mcu::McuFlasher,
    mpu::{BootBanner, FlashFailure, MpuFlasher, Stage, Timings},
    netconf::{AddressNegotiator, LocalNegotiator, TcpProbe, negotiate},
    port::{NativePort, NativePortEnumerator, Port, PortEnumerator, SerialConfig},
    provision::{Progress, ProgressSink, ProvisionError, Provisioner, RunOptions, RunStep, RunSummary},
    tftp::{TftpHandle, TftpServer},
    watcher::{differ, reset_board, wait_for_reset},
};
