//! Provision command implementation.

use anyhow::Result;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use yunflash::netconf::DEFAULT_PROBE_PORT;
use yunflash::{Progress, ProvisionError, Provisioner, RunOptions};

use crate::config::{Config, bundle_dir};
use crate::{Cli, CliError, ProvisionArgs, use_fancy_output};

/// Combine command-line arguments, config file and defaults.
pub(crate) fn resolve_options(
    cli: &Cli,
    config: &Config,
    args: &ProvisionArgs,
) -> Result<RunOptions, CliError> {
    match (args.server_ip, args.board_ip) {
        (Some(_), None) => {
            return Err(CliError::Usage("--serverip requires --boardip".into()));
        },
        (None, Some(_)) => {
            return Err(CliError::Usage("--boardip requires --serverip".into()));
        },
        _ => {},
    }

    let (server_addr, board_addr) = if args.server_ip.is_some() {
        (args.server_ip, args.board_ip)
    } else {
        (config.network.server_ip, config.network.board_ip)
    };

    let tftp_dir = args
        .tftp_dir
        .clone()
        .or_else(|| config.paths.tftp_dir.clone())
        .unwrap_or_else(|| bundle_dir().join("tftp"));
    let avr_dir = args
        .avr_dir
        .clone()
        .or_else(|| config.paths.avr_dir.clone())
        .unwrap_or_else(|| bundle_dir().join("avr"));

    let defaults = RunOptions::default();
    Ok(RunOptions {
        flash_bootloader: args.flash_bootloader || config.board.flash_bootloader,
        target_board: args
            .board
            .clone()
            .or_else(|| config.board.target.clone())
            .unwrap_or(defaults.target_board),
        server_addr,
        board_addr,
        port: cli.port.clone().or_else(|| config.serial.port.clone()),
        tftp_dir,
        tftp_bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, args.tftp_port)),
        avr_dir,
        flash_mcu: !args.no_mcu,
        probe_port: config.network.probe_port.unwrap_or(DEFAULT_PROBE_PORT),
    })
}

/// Prints progress notifications to stderr, above a spinner when attached to a terminal.
struct ProgressPrinter {
    quiet: bool,
    spinner: ProgressBar,
}

impl ProgressPrinter {
    fn new(quiet: bool) -> Self {
        let spinner = if quiet || !use_fancy_output() {
            ProgressBar::hidden()
        } else {
            let pb = ProgressBar::new_spinner();
            #[allow(clippy::unwrap_used)] // Static template string
            pb.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner:.green} [{elapsed_precise}] {msg}")
                    .unwrap(),
            );
            pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
            pb.enable_steady_tick(Duration::from_millis(120));
            pb
        };
        Self { quiet, spinner }
    }

    fn line(&self, text: String) {
        if self.quiet {
            return;
        }
        if self.spinner.is_hidden() {
            eprintln!("{text}");
        } else {
            self.spinner.println(text);
        }
    }

    fn show(&self, progress: &Progress) {
        debug!("{progress:?}");
        match progress {
            Progress::Started(step) => {
                self.spinner.set_message(step.to_string());
                self.line(format!("{} {step}", style("▶").cyan()));
            },
            Progress::Finished(step, result) => {
                self.line(format!("{} {step}: {result}", style("✓").green()));
            },
            Progress::Skipped(step) => {
                self.line(format!("{} {step}: skipped", style("-").dim()));
            },
            Progress::Stage(stage) => {
                self.spinner.set_message(format!("MPU: {stage}"));
                self.line(format!("    {} {stage}", style("•").dim()));
            },
            Progress::Retry { attempt, reason } => {
                self.line(format!(
                    "{} Attempt {attempt} failed: {reason}, retrying",
                    style("⚠").yellow()
                ));
            },
        }
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

fn print_transcript(err: &ProvisionError) {
    let transcript = err.transcript.trim();
    if transcript.is_empty() {
        return;
    }
    eprintln!("{}", style("Last console output:").yellow().bold());
    for line in transcript.lines() {
        eprintln!("  {}", style(line).dim());
    }
}

/// Provision command implementation.
pub(crate) fn cmd_provision(cli: &Cli, config: &Config, args: &ProvisionArgs) -> Result<()> {
    let options = resolve_options(cli, config, args)?;
    if !options.tftp_dir.is_dir() {
        anyhow::bail!(
            "TFTP directory {} does not exist",
            options.tftp_dir.display()
        );
    }
    if options.flash_mcu && !options.avr_dir.is_dir() {
        anyhow::bail!(
            "AVR directory {} does not exist (use --no-mcu to skip MCU uploads)",
            options.avr_dir.display()
        );
    }

    if !cli.quiet {
        eprintln!(
            "{} Provisioning board \"{}\"{}",
            style("📦").cyan(),
            options.target_board,
            if options.flash_bootloader {
                " (with bootloader)"
            } else {
                ""
            }
        );
        eprintln!(
            "    {} serving {}",
            style("•").dim(),
            display_dir(&options.tftp_dir)
        );
    }

    let printer = ProgressPrinter::new(cli.quiet);
    let mut sink = |progress: &Progress| printer.show(progress);
    let result = Provisioner::new(options, &mut sink).run();
    printer.finish();

    match result {
        Ok(summary) => {
            if !cli.quiet {
                eprintln!(
                    "\n{} Board provisioned after {} attempt(s), now on {}",
                    style("🎉").green().bold(),
                    summary.attempts,
                    style(&summary.port).cyan()
                );
            }
            Ok(())
        },
        Err(err) => {
            print_transcript(&err);
            if matches!(err.source, yunflash::Error::Interrupted) {
                return Err(CliError::Cancelled(format!("{} interrupted", err.step)).into());
            }
            Err(err.into())
        },
    }
}

fn display_dir(path: &Path) -> String {
    path.canonicalize()
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}
