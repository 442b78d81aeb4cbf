//! End-to-end provisioning run.
//!
//! File server, addresses, MCU terminal sketch, MPU flashing with outer
//! retries, then the final MCU firmware. Progress is reported to a
//! [`ProgressSink`] so the caller decides how to present it.

use std::fmt;
use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use log::{error, info, warn};

use crate::console::ConsoleSession;
use crate::context::{Artifact, BOOTLOADER_IMAGE, FlashContext, SYSUPGRADE_IMAGE};
use crate::device;
use crate::error::Error;
use crate::is_interrupted_requested;
use crate::mcu::{FIRMWARE_HEX, McuFlasher, TERMINAL_HEX};
use crate::mpu::{FlashFailure, MpuFlasher, Stage, Timings};
use crate::netconf::{AddressNegotiator, DEFAULT_PROBE_PORT, LocalNegotiator, TcpProbe};
use crate::tftp::{DEFAULT_PORT, TftpServer};

/// Maximum number of end-to-end MPU flashing attempts.
pub const MAX_ATTEMPTS: usize = 3;

/// Steps of a provisioning run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunStep {
    /// Start the TFTP server.
    StartFileServer,
    /// Find the host and board addresses.
    NegotiateAddresses,
    /// Size the images to serve.
    PrepareArtifacts,
    /// Find the board's serial port.
    LocateBoard,
    /// Upload the serial terminal sketch to the MCU.
    FlashTerminalSketch,
    /// Open the bridged Linux console.
    OpenConsole,
    /// Flash the MPU bootloader and image.
    FlashMpu,
    /// Find the board's serial port after the MPU flash.
    RelocateBoard,
    /// Upload the final MCU firmware.
    FlashMcuFirmware,
}

impl fmt::Display for RunStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::StartFileServer => "Start TFTP server",
            Self::NegotiateAddresses => "Find IP addresses",
            Self::PrepareArtifacts => "Check firmware images",
            Self::LocateBoard => "Find serial port for upload",
            Self::FlashTerminalSketch => "Upload serial terminal to MCU",
            Self::OpenConsole => "Open MPU console",
            Self::FlashMpu => "Flash MPU bootloader and Linux image",
            Self::RelocateBoard => "Find serial port for firmware upload",
            Self::FlashMcuFirmware => "Upload final firmware to MCU",
        };
        f.write_str(name)
    }
}

/// A progress notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// A run step started.
    Started(RunStep),
    /// A run step finished, with a short result.
    Finished(RunStep, String),
    /// A step was skipped.
    Skipped(RunStep),
    /// The MPU flasher entered a stage.
    Stage(Stage),
    /// An MPU flashing attempt failed and will be retried.
    Retry {
        /// Attempt that failed.
        attempt: usize,
        /// Why it failed.
        reason: String,
    },
}

/// Receiver of [`Progress`] notifications.
pub trait ProgressSink {
    /// Handle one notification.
    fn report(&mut self, progress: &Progress);
}

impl<F: FnMut(&Progress)> ProgressSink for F {
    fn report(&mut self, progress: &Progress) {
        self(progress);
    }
}

fn stage_suffix(stage: &Option<Stage>) -> String {
    stage
        .as_ref()
        .map(|s| format!(" during {s}"))
        .unwrap_or_default()
}

/// A provisioning run that ended in failure.
#[derive(Debug, thiserror::Error)]
#[error("{step} failed{}: {source}", stage_suffix(.stage))]
pub struct ProvisionError {
    /// Run step that failed.
    pub step: RunStep,
    /// MPU stage, when the MPU flasher failed.
    pub stage: Option<Stage>,
    /// Last console output, if any.
    pub transcript: String,
    /// Underlying error.
    #[source]
    pub source: Error,
}

impl ProvisionError {
    fn at(step: RunStep, source: Error) -> Self {
        Self {
            step,
            stage: None,
            transcript: String::new(),
            source,
        }
    }

    fn from_flash(failure: FlashFailure) -> Self {
        Self {
            step: RunStep::FlashMpu,
            stage: Some(failure.stage),
            transcript: failure.transcript,
            source: failure.source,
        }
    }
}

/// Parameters of a provisioning run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Flash the bootloader even if it looks current.
    pub flash_bootloader: bool,
    /// Board identifier written to the bootloader environment.
    pub target_board: String,
    /// Host address override.
    pub server_addr: Option<Ipv4Addr>,
    /// Board address override.
    pub board_addr: Option<Ipv4Addr>,
    /// Serial port override.
    pub port: Option<String>,
    /// Directory served over TFTP.
    pub tftp_dir: PathBuf,
    /// Address the TFTP server binds to.
    pub tftp_bind: SocketAddr,
    /// Directory holding `avrdude` and the MCU hex files.
    pub avr_dir: PathBuf,
    /// Upload the MCU sketches before and after the MPU flash.
    pub flash_mcu: bool,
    /// TCP port used to probe for a free board address.
    pub probe_port: u16,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            flash_bootloader: false,
            target_board: "Yun".to_string(),
            server_addr: None,
            board_addr: None,
            port: None,
            tftp_dir: PathBuf::from("tftp"),
            tftp_bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            avr_dir: PathBuf::from("avr"),
            flash_mcu: true,
            probe_port: DEFAULT_PROBE_PORT,
        }
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Final flashing context.
    pub context: FlashContext,
    /// Number of MPU flashing attempts used.
    pub attempts: usize,
    /// Serial port of the board after the final MCU upload.
    pub port: String,
}

/// Pick the serial port for a step.
///
/// An explicit port only names the board before its first reset; once an
/// upload has reported where the board came back, that tracked port wins.
/// Without an explicit port the board is detected by its USB identifiers.
fn choose_port(
    explicit: Option<&str>,
    tracked: Option<&str>,
    detect: impl FnOnce() -> crate::error::Result<String>,
) -> crate::error::Result<String> {
    match (explicit, tracked) {
        (Some(_), Some(tracked)) => Ok(tracked.to_string()),
        (Some(explicit), None) => Ok(explicit.to_string()),
        (None, _) => detect(),
    }
}

fn check_interrupted(step: RunStep) -> Result<(), ProvisionError> {
    if is_interrupted_requested() {
        Err(ProvisionError::at(step, Error::Interrupted))
    } else {
        Ok(())
    }
}

/// Flash the MPU, retrying the whole sequence on retryable failures.
///
/// Between attempts the addresses are renegotiated away from the host address
/// that failed; if that is impossible the previous addresses are kept.
pub fn flash_mpu_with_retries<T, N>(
    session: &mut ConsoleSession<T>,
    negotiator: &mut N,
    mut context: FlashContext,
    timings: Timings,
    sink: &mut dyn ProgressSink,
) -> Result<(FlashContext, usize), ProvisionError>
where
    T: Read + Write,
    N: AddressNegotiator,
{
    for attempt in 1..=MAX_ATTEMPTS {
        check_interrupted(RunStep::FlashMpu)?;

        let mut flasher = MpuFlasher::new(session, negotiator, context).with_timings(timings);
        let outcome = flasher.run_with_progress(&mut |stage| sink.report(&Progress::Stage(stage)));
        context = flasher.into_context();

        let failure = match outcome {
            Ok(_) => return Ok((context, attempt)),
            Err(failure) => failure,
        };

        if !failure.is_retryable() || attempt == MAX_ATTEMPTS {
            error!("Firmware upload failed: {failure}");
            return Err(ProvisionError::from_flash(failure));
        }

        warn!("Firmware upload failed (attempt {attempt}/{MAX_ATTEMPTS}): {failure}");
        sink.report(&Progress::Retry {
            attempt,
            reason: failure.to_string(),
        });

        match negotiator.negotiate(Some(context.server_addr)) {
            Ok((server, board)) => context = context.with_addresses(server, board),
            Err(e) => warn!("Keeping {} / {}: {e}", context.server_addr, context.board_addr),
        }
    }

    Err(ProvisionError::at(
        RunStep::FlashMpu,
        Error::Protocol(format!("no success after {MAX_ATTEMPTS} attempts")),
    ))
}

/// Runs the complete provisioning sequence.
pub struct Provisioner<'a> {
    options: RunOptions,
    timings: Timings,
    sink: &'a mut dyn ProgressSink,
}

impl<'a> Provisioner<'a> {
    /// Create a run with the given options.
    pub fn new(options: RunOptions, sink: &'a mut dyn ProgressSink) -> Self {
        Self {
            options,
            timings: Timings::default(),
            sink,
        }
    }

    /// Override MPU delays and deadlines.
    #[must_use]
    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    fn start(&mut self, step: RunStep) -> Result<(), ProvisionError> {
        check_interrupted(step)?;
        info!("{step}");
        self.sink
            .report(&Progress::Started(step));
        Ok(())
    }

    fn finish(&mut self, step: RunStep, detail: impl Into<String>) {
        self.sink
            .report(&Progress::Finished(step, detail.into()));
    }

    fn locate(&mut self, step: RunStep, tracked: Option<&str>) -> Result<String, ProvisionError> {
        self.start(step)?;
        let port = choose_port(self.options.port.as_deref(), tracked, || {
            device::find_flashing_port().map(|endpoint| endpoint.name)
        })
        .map_err(|e| ProvisionError::at(step, e))?;
        self.finish(step, port.clone());
        Ok(port)
    }

    /// Run every step.
    pub fn run(&mut self) -> Result<RunSummary, ProvisionError> {
        self.start(RunStep::StartFileServer)?;
        let server = TftpServer::bind(self.options.tftp_bind, &self.options.tftp_dir)
            .and_then(TftpServer::spawn)
            .map_err(|e| ProvisionError::at(RunStep::StartFileServer, e))?;
        self.finish(RunStep::StartFileServer, server.local_addr().to_string());

        self.start(RunStep::NegotiateAddresses)?;
        let mut negotiator = LocalNegotiator::new(TcpProbe {
            port: self.options.probe_port,
            ..TcpProbe::default()
        });
        let (server_addr, board_addr) = match (self.options.server_addr, self.options.board_addr) {
            (Some(server), Some(board)) => (server, board),
            (server, board) => {
                if server.is_some() || board.is_some() {
                    warn!("Both --serverip and --boardip are needed to skip discovery");
                }
                negotiator
                    .negotiate(None)
                    .map_err(|e| ProvisionError::at(RunStep::NegotiateAddresses, e))?
            },
        };
        info!("Using {server_addr} as server address and {board_addr} as board address");
        self.finish(
            RunStep::NegotiateAddresses,
            format!("server {server_addr}, board {board_addr}"),
        );

        self.start(RunStep::PrepareArtifacts)?;
        let dir = &self.options.tftp_dir;
        let bootloader = Artifact::from_dir(dir, BOOTLOADER_IMAGE)
            .map_err(|e| ProvisionError::at(RunStep::PrepareArtifacts, e))?;
        let sysupgrade = Artifact::from_dir(dir, SYSUPGRADE_IMAGE)
            .map_err(|e| ProvisionError::at(RunStep::PrepareArtifacts, e))?;
        self.finish(
            RunStep::PrepareArtifacts,
            format!("{} bytes, {} bytes", bootloader.size, sysupgrade.size),
        );

        let context = FlashContext {
            server_addr,
            board_addr,
            flash_bootloader: self.options.flash_bootloader,
            target_board: self
                .options
                .target_board
                .clone(),
            bootloader,
            sysupgrade,
        };

        let mut port = self.locate(RunStep::LocateBoard, None)?;
        let mcu = McuFlasher::from_bundle(&self.options.avr_dir);

        if self.options.flash_mcu {
            self.start(RunStep::FlashTerminalSketch)?;
            port = mcu
                .flash_hex(&port, TERMINAL_HEX)
                .map_err(|e| ProvisionError::at(RunStep::FlashTerminalSketch, e))?;
            self.finish(RunStep::FlashTerminalSketch, port.clone());
        } else {
            self.sink
                .report(&Progress::Skipped(RunStep::FlashTerminalSketch));
        }

        self.start(RunStep::OpenConsole)?;
        let mut session =
            ConsoleSession::open(&port).map_err(|e| ProvisionError::at(RunStep::OpenConsole, e))?;
        self.finish(RunStep::OpenConsole, port.clone());

        self.start(RunStep::FlashMpu)?;
        let outcome = flash_mpu_with_retries(&mut session, &mut negotiator, context, self.timings, &mut *self.sink);
        session.close();
        let (context, attempts) = outcome?;
        self.finish(RunStep::FlashMpu, format!("{attempts} attempt(s)"));

        if self.options.flash_mcu {
            let port_now = self.locate(RunStep::RelocateBoard, Some(&port))?;

            self.start(RunStep::FlashMcuFirmware)?;
            port = mcu
                .flash_hex(&port_now, FIRMWARE_HEX)
                .map_err(|e| ProvisionError::at(RunStep::FlashMcuFirmware, e))?;
            self.finish(RunStep::FlashMcuFirmware, port.clone());
        } else {
            self.sink
                .report(&Progress::Skipped(RunStep::FlashMcuFirmware));
        }

        server.shutdown();
        info!("All done");
        Ok(RunSummary {
            context,
            attempts,
            port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::mock::ScriptedPort;
    use crate::error::Result;
    use std::time::Duration;

    struct Counting {
        calls: usize,
        fail: bool,
    }

    impl AddressNegotiator for Counting {
        fn negotiate(&mut self, _exclude: Option<Ipv4Addr>) -> Result<(Ipv4Addr, Ipv4Addr)> {
            self.calls += 1;
            if self.fail {
                return Err(Error::NetworkUnreachable("offline".into()));
            }
            let host = u8::try_from(self.calls).unwrap_or(u8::MAX);
            Ok((Ipv4Addr::new(10, 0, host, 1), Ipv4Addr::new(10, 0, host, 24)))
        }
    }

    fn fast() -> Timings {
        Timings {
            shell: Duration::from_millis(20),
            banner: Duration::from_millis(50),
            prompt: Duration::from_millis(50),
            network: Duration::from_millis(50),
            bootloader: Duration::from_millis(50),
            resync: Duration::from_millis(50),
            image: Duration::from_millis(50),
            transfer_settle: Duration::ZERO,
            reset_settle: Duration::ZERO,
        }
    }

    fn context() -> FlashContext {
        FlashContext {
            server_addr: Ipv4Addr::new(192, 168, 1, 10),
            board_addr: Ipv4Addr::new(192, 168, 1, 24),
            flash_bootloader: false,
            target_board: "Yun".into(),
            bootloader: Artifact::new(BOOTLOADER_IMAGE, 500),
            sysupgrade: Artifact::new(SYSUPGRADE_IMAGE, 1000),
        }
    }

    #[test]
    fn test_retryable_failure_runs_three_attempts() {
        let mut session = ConsoleSession::new(ScriptedPort::new());
        let mut negotiator = Counting {
            calls: 0,
            fail: false,
        };
        let mut events = Vec::new();
        let mut sink = |p: &Progress| events.push(p.clone());

        let err = flash_mpu_with_retries(&mut session, &mut negotiator, context(), fast(), &mut sink)
            .unwrap_err();

        assert_eq!(err.step, RunStep::FlashMpu);
        assert_eq!(err.stage, Some(Stage::DetectBootStopKeyword));
        assert!(err.source.is_timeout());
        assert_eq!(negotiator.calls, MAX_ATTEMPTS - 1);

        let retries = events
            .iter()
            .filter(|p| matches!(p, Progress::Retry { .. }))
            .count();
        assert_eq!(retries, MAX_ATTEMPTS - 1);
        let starts = events
            .iter()
            .filter(|p| **p == Progress::Stage(Stage::AwaitShellBoot))
            .count();
        assert_eq!(starts, MAX_ATTEMPTS);
    }

    #[test]
    fn test_fatal_failure_is_not_retried() {
        let mut session = ConsoleSession::new(ScriptedPort::new().broken());
        let mut negotiator = Counting {
            calls: 0,
            fail: false,
        };
        let mut sink = |_: &Progress| {};

        let err = flash_mpu_with_retries(&mut session, &mut negotiator, context(), fast(), &mut sink)
            .unwrap_err();

        assert_eq!(err.stage, Some(Stage::AwaitShellBoot));
        assert!(matches!(err.source, Error::Io(_)));
        assert_eq!(negotiator.calls, 0);
    }

    #[test]
    fn test_failed_renegotiation_keeps_addresses() {
        let mut session = ConsoleSession::new(ScriptedPort::new());
        let mut negotiator = Counting {
            calls: 0,
            fail: true,
        };
        let mut sink = |_: &Progress| {};

        let err = flash_mpu_with_retries(&mut session, &mut negotiator, context(), fast(), &mut sink)
            .unwrap_err();

        assert!(err.source.is_timeout());
        assert_eq!(negotiator.calls, MAX_ATTEMPTS - 1);
        assert!(
            err.to_string()
                .starts_with("Flash MPU bootloader and Linux image failed during bootloader detection")
        );
    }

    #[test]
    fn test_explicit_port_follows_reenumeration() {
        let port = choose_port(Some("/dev/ttyACM0"), Some("/dev/ttyACM1"), || {
            panic!("an explicit port never triggers detection")
        })
        .unwrap();
        assert_eq!(port, "/dev/ttyACM1");
    }

    #[test]
    fn test_explicit_port_used_before_first_upload() {
        let port = choose_port(Some("/dev/ttyACM0"), None, || Ok("/dev/ttyUSB9".into())).unwrap();
        assert_eq!(port, "/dev/ttyACM0");
    }

    #[test]
    fn test_port_detected_without_explicit_port() {
        let port = choose_port(None, Some("/dev/ttyACM1"), || Ok("/dev/ttyACM2".into())).unwrap();
        assert_eq!(port, "/dev/ttyACM2");

        let err = choose_port(None, None, || Err(Error::DeviceNotFound)).unwrap_err();
        assert!(matches!(err, Error::DeviceNotFound));
    }

    #[test]
    fn test_run_stops_on_missing_images() {
        let dir = tempfile::tempdir().unwrap();
        let options = RunOptions {
            server_addr: Some(Ipv4Addr::new(192, 168, 1, 10)),
            board_addr: Some(Ipv4Addr::new(192, 168, 1, 24)),
            tftp_dir: dir.path().to_path_buf(),
            tftp_bind: "127.0.0.1:0".parse().unwrap(),
            ..RunOptions::default()
        };
        let mut events = Vec::new();
        let mut sink = |p: &Progress| events.push(p.clone());

        let err = Provisioner::new(options, &mut sink)
            .run()
            .unwrap_err();

        assert_eq!(err.step, RunStep::PrepareArtifacts);
        assert!(matches!(err.source, Error::Config(_)));
        assert_eq!(events[0], Progress::Started(RunStep::StartFileServer));
        assert!(events.contains(&Progress::Finished(
            RunStep::NegotiateAddresses,
            "server 192.168.1.10, board 192.168.1.24".into()
        )));
    }
}
