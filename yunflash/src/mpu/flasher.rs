//! Stage sequencing of an MPU flashing run.

use std::io::{Read, Write};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use super::script::{self, BootBanner, STOCK_PROMPT};
use super::{FlashFailure, MAX_NETWORK_ATTEMPTS, Stage, Timings};
use crate::console::{BatchError, ConsoleSession, Step, StepResult};
use crate::context::FlashContext;
use crate::error::Error;
use crate::netconf::AddressNegotiator;

type StageResult<T> = std::result::Result<T, FlashFailure>;

/// Drives one bootloader session from the Linux shell to the image handover.
///
/// The flasher borrows the console for its whole run, so no other reader can
/// interleave with a batch.
pub struct MpuFlasher<'a, T: Read + Write, N: AddressNegotiator> {
    session: &'a mut ConsoleSession<T>,
    negotiator: &'a mut N,
    context: FlashContext,
    timings: Timings,
    prompt: String,
}

impl<'a, T: Read + Write, N: AddressNegotiator> MpuFlasher<'a, T, N> {
    /// Create a flasher over an open console session.
    pub fn new(session: &'a mut ConsoleSession<T>, negotiator: &'a mut N, context: FlashContext) -> Self {
        Self {
            session,
            negotiator,
            context,
            timings: Timings::default(),
            prompt: STOCK_PROMPT.to_string(),
        }
    }

    /// Override delays and deadlines.
    #[must_use]
    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    /// The current context, including renegotiated addresses.
    pub fn context(&self) -> &FlashContext {
        &self.context
    }

    /// Consume the flasher and return its final context.
    pub fn into_context(self) -> FlashContext {
        self.context
    }

    /// Run every stage. Returns the console output of the handover.
    pub fn run(&mut self) -> StageResult<String> {
        self.run_with_progress(&mut |_| {})
    }

    /// Run every stage, reporting each one as it starts.
    pub fn run_with_progress<F>(&mut self, progress: &mut F) -> StageResult<String>
    where
        F: FnMut(Stage),
    {
        progress(Stage::AwaitShellBoot);
        self.await_shell_boot()?;

        progress(Stage::DetectBootStopKeyword);
        let banner = self.detect_banner()?;

        progress(Stage::DetectShellPrompt);
        self.detect_prompt(&banner)?;

        if self.context.flash_bootloader {
            progress(Stage::FlashBootloader);
            self.flash_bootloader()?;
        } else {
            info!("Bootloader flash skipped");
        }

        progress(Stage::ConfigureNetwork);
        info!("Setting up IP addresses");
        self.configure_network(Stage::ConfigureNetwork)?;

        progress(Stage::TransferAndWriteImage);
        let handover = self.flash_image()?;

        progress(Stage::Done);
        Ok(handover)
    }

    fn batch(&mut self, stage: Stage, steps: Vec<Step>, timeout: Duration) -> StageResult<Vec<StepResult>> {
        self.session
            .run_batch(&steps, timeout)
            .map_err(|err| batch_failure(stage, err))
    }

    fn await_shell_boot(&mut self) -> StageResult<()> {
        let steps = script::shell_reboot().map_err(|e| failure(Stage::AwaitShellBoot, e, &[]))?;

        match self
            .session
            .run_batch(&steps, self.timings.shell)
        {
            Ok(_) => info!("Rebooting the board"),
            Err(err) if err.is_timeout() => {
                info!("Reboot the board using the reset button");
            },
            Err(err) => return Err(batch_failure(Stage::AwaitShellBoot, err)),
        }
        Ok(())
    }

    fn detect_banner(&mut self) -> StageResult<BootBanner> {
        let stage = Stage::DetectBootStopKeyword;
        let steps = script::boot_banner().map_err(|e| failure(stage, e, &[]))?;
        let results = self.batch(stage, steps, self.timings.banner)?;

        let banner = first(&results)
            .and_then(BootBanner::classify)
            .map_err(|e| failure(stage, e, &results))?;
        if banner == BootBanner::Legacy {
            info!("Old bootloader detected");
        }
        info!("Using stop command: {:?}", banner.stop_keyword());
        Ok(banner)
    }

    fn detect_prompt(&mut self, banner: &BootBanner) -> StageResult<()> {
        let stage = Stage::DetectShellPrompt;
        let steps = script::stop_autoboot(banner.stop_keyword()).map_err(|e| failure(stage, e, &[]))?;
        let results = self.batch(stage, steps, self.timings.prompt)?;

        let prompt = first(&results)
            .and_then(|r| {
                r.non_empty("prompt")
                    .map(str::to_string)
                    .ok_or_else(|| Error::Protocol("empty prompt".into()))
            })
            .map_err(|e| failure(stage, e, &results))?;
        info!("Got shell: {prompt}");

        if prompt != STOCK_PROMPT && !self.context.flash_bootloader {
            info!("Bootloader prompt {prompt:?} is outdated, flashing the bootloader too");
            self.context = self
                .context
                .clone()
                .with_bootloader_flash();
        }
        self.prompt = prompt;
        Ok(())
    }

    /// Network setup with renegotiation between attempts.
    fn configure_network(&mut self, stage: Stage) -> StageResult<()> {
        for attempt in 1..=MAX_NETWORK_ATTEMPTS {
            let steps = script::network_setup(&self.prompt, self.context.server_addr, self.context.board_addr)
                .map_err(|e| failure(stage, e, &[]))?;

            match self
                .session
                .run_batch(&steps, self.timings.network)
            {
                Ok(_) => {
                    if attempt > 1 {
                        debug!("Network setup succeeded on attempt {attempt}");
                    }
                    return Ok(());
                },
                Err(err) if err.is_timeout() && attempt < MAX_NETWORK_ATTEMPTS => {
                    warn!("Network setup failed (attempt {attempt}/{MAX_NETWORK_ATTEMPTS}): {err}");
                    let failed = self.context.server_addr;
                    let (server, board) = self
                        .negotiator
                        .negotiate(Some(failed))
                        .map_err(|e| failure(stage, e, &[]))?;
                    self.context = self
                        .context
                        .clone()
                        .with_addresses(server, board);
                },
                Err(err) => return Err(batch_failure(stage, err)),
            }
        }

        Err(failure(
            stage,
            Error::Protocol(format!("network setup failed after {MAX_NETWORK_ATTEMPTS} attempts")),
            &[],
        ))
    }

    fn flash_bootloader(&mut self) -> StageResult<()> {
        let stage = Stage::FlashBootloader;
        info!("Flashing bootloader");

        self.configure_network(stage)?;
        thread::sleep(self.timings.transfer_settle);

        let steps = script::bootloader_transfer(&self.prompt, &self.context.bootloader)
            .map_err(|e| failure(stage, e, &[]))?;
        let results = self.batch(stage, steps, self.timings.bootloader)?;
        self.verify_transfer(stage, &results, false)?;

        let steps = script::bootloader_write().map_err(|e| failure(stage, e, &[]))?;
        self.batch(stage, steps, self.timings.bootloader)?;

        thread::sleep(self.timings.reset_settle);

        let steps = script::bootloader_resync(&self.context.target_board).map_err(|e| failure(stage, e, &[]))?;
        self.batch(stage, steps, self.timings.resync)?;

        self.prompt = STOCK_PROMPT.to_string();
        info!("Bootloader flashed");
        Ok(())
    }

    fn flash_image(&mut self) -> StageResult<String> {
        let stage = Stage::TransferAndWriteImage;
        info!("Flashing sysupgrade image");
        thread::sleep(self.timings.transfer_settle);

        let steps = script::image_transfer(&self.context).map_err(|e| failure(stage, e, &[]))?;
        let results = self.batch(stage, steps, self.timings.image)?;
        self.verify_transfer(stage, &results, true)?;

        let steps = script::image_erase(&self.context.sysupgrade).map_err(|e| failure(stage, e, &[]))?;
        let results = self.batch(stage, steps, self.timings.image)?;
        first(&results)
            .and_then(|r| script::captured_number(r, "sectors"))
            .and_then(|n| script::check_erased(&self.context.sysupgrade, n))
            .map_err(|e| failure(stage, e, &results))?;

        let steps = script::image_copy(&self.prompt).map_err(|e| failure(stage, e, &[]))?;
        let results = self.batch(stage, steps, self.timings.image)?;

        Ok(results
            .last()
            .map(|r| r.output.clone())
            .unwrap_or_default())
    }

    /// Compare the byte count of the last transfer with the artifact size.
    fn verify_transfer(&self, stage: Stage, results: &[StepResult], image: bool) -> StageResult<()> {
        let artifact = if image {
            &self.context.sysupgrade
        } else {
            &self.context.bootloader
        };

        results
            .last()
            .ok_or_else(|| Error::Protocol("no transfer result".into()))
            .and_then(|r| script::captured_number(r, "bytes"))
            .and_then(|bytes| artifact.verify_transfer(bytes))
            .map_err(|e| failure(stage, e, results))?;

        debug!("Transferred {} ({} bytes)", artifact.name, artifact.size);
        Ok(())
    }
}

fn first(results: &[StepResult]) -> crate::error::Result<&StepResult> {
    results
        .first()
        .ok_or_else(|| Error::Protocol("batch returned no result".into()))
}

fn failure(stage: Stage, source: Error, results: &[StepResult]) -> FlashFailure {
    FlashFailure {
        stage,
        transcript: results
            .last()
            .map(|r| r.output.clone())
            .unwrap_or_default(),
        source,
    }
}

fn batch_failure(stage: Stage, err: BatchError) -> FlashFailure {
    FlashFailure {
        stage,
        transcript: err
            .transcript()
            .to_string(),
        source: err.error,
    }
}
