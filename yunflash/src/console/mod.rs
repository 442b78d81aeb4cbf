//! Send/expect automaton over a serial console.
//!
//! A [`ConsoleSession`] owns one byte stream and a buffer of received text
//! that no expect step has consumed yet. Scripts are expressed as data: a
//! batch is a slice of [`Step`]s executed in order under one deadline.
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use yunflash::console::{ConsoleSession, Step};
//!
//! fn main() -> yunflash::Result<()> {
//!     let mut session = ConsoleSession::open("/dev/ttyACM0")?;
//!     let results = session.run_batch(
//!         &[Step::line("printenv ipaddr"), Step::expect(r"ipaddr=(\S+)")?],
//!         Duration::from_secs(5),
//!     )?;
//!     println!("board address: {:?}", results[0].group(1));
//!     Ok(())
//! }
//! ```

pub mod text;

#[cfg(test)]
pub(crate) mod mock;

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use regex::Regex;

use crate::error::{Error, Result};
use crate::port::{CONSOLE_BAUD, NativePort, SerialConfig};

/// How long a single transport read may block.
pub const READ_POLL: Duration = Duration::from_millis(100);

/// Pause after a read that returned nothing.
const IDLE_DELAY: Duration = Duration::from_millis(5);

/// Maximum number of attempts to open the console port.
const MAX_OPEN_ATTEMPTS: usize = 3;

/// Delay between open attempts.
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(500);

/// One scripted protocol step.
#[derive(Debug, Clone)]
pub enum Step {
    /// Write literal bytes to the console.
    Send(Vec<u8>),
    /// Wait for a pattern to appear in the unread output.
    Expect(Expect),
}

/// An expect step: a pattern and an optional step-local timeout.
#[derive(Debug, Clone)]
pub struct Expect {
    pattern: Regex,
    timeout: Option<Duration>,
}

impl Expect {
    /// The pattern as written.
    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    /// The step-local timeout, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

impl Step {
    /// Send raw text.
    pub fn send(text: impl Into<String>) -> Self {
        Self::Send(text.into().into_bytes())
    }

    /// Send a command terminated by a single newline.
    pub fn line(command: impl fmt::Display) -> Self {
        Self::Send(format!("{command}\n").into_bytes())
    }

    /// Expect a regular expression.
    pub fn expect(pattern: &str) -> Result<Self> {
        Ok(Self::Expect(Expect {
            pattern: Regex::new(pattern)?,
            timeout: None,
        }))
    }

    /// Expect a regular expression within its own timeout.
    pub fn expect_within(pattern: &str, timeout: Duration) -> Result<Self> {
        Ok(Self::Expect(Expect {
            pattern: Regex::new(pattern)?,
            timeout: Some(timeout),
        }))
    }

    /// Expect literal text.
    pub fn expect_text(text: &str) -> Result<Self> {
        Self::expect(&regex::escape(text))
    }
}

/// Outcome of a matched expect step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepResult {
    /// Index of the step inside its batch.
    pub step: usize,
    /// Text consumed by this step, up to and including the match.
    pub output: String,
    groups: Vec<Option<String>>,
    named: HashMap<String, String>,
}

impl StepResult {
    /// The whole match.
    pub fn matched(&self) -> &str {
        self.group(0).unwrap_or_default()
    }

    /// A positional capture group; `None` if it did not participate.
    pub fn group(&self, index: usize) -> Option<&str> {
        self.groups
            .get(index)
            .and_then(|g| g.as_deref())
    }

    /// A named capture group; `None` if it did not participate.
    pub fn name(&self, name: &str) -> Option<&str> {
        self.named
            .get(name)
            .map(String::as_str)
    }

    /// A named capture group that matched a non-empty string.
    pub fn non_empty(&self, name: &str) -> Option<&str> {
        self.name(name)
            .filter(|s| !s.is_empty())
    }
}

/// A failed batch: the error plus the results of the steps that did match.
#[derive(Debug)]
pub struct BatchError {
    /// Why the batch stopped.
    pub error: Error,
    /// Index of the failing step.
    pub step: usize,
    /// Results of the expect steps matched before the failure.
    pub results: Vec<StepResult>,
}

impl BatchError {
    /// Raw output of the failing step, for diagnostics.
    pub fn transcript(&self) -> &str {
        match &self.error {
            Error::ProtocolTimeout { transcript, .. } => transcript,
            _ => self
                .results
                .last()
                .map_or("", |r| r.output.as_str()),
        }
    }

    /// Whether the batch failed because a pattern never arrived.
    pub fn is_timeout(&self) -> bool {
        self.error.is_timeout()
    }
}

impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step {}: {}", self.step, self.error)
    }
}

impl std::error::Error for BatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl From<BatchError> for Error {
    fn from(err: BatchError) -> Self {
        err.error
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// The transport is open.
    Open,
    /// The transport was released.
    Closed,
}

/// A console session exclusively owning one transport.
pub struct ConsoleSession<T: Read + Write> {
    transport: Option<T>,
    pending: Vec<u8>,
    unread: String,
}

impl ConsoleSession<NativePort> {
    /// Open the board console at 115200 baud.
    pub fn open(port_name: &str) -> Result<Self> {
        let mut last_error = None;

        for attempt in 1..=MAX_OPEN_ATTEMPTS {
            let config = SerialConfig::new(port_name, CONSOLE_BAUD).with_timeout(READ_POLL);
            match NativePort::open(&config) {
                Ok(port) => {
                    if attempt > 1 {
                        debug!("Console opened on attempt {attempt}");
                    }
                    return Ok(Self::new(port));
                },
                Err(e) => {
                    warn!(
                        "Failed to open console {port_name} (attempt {attempt}/{MAX_OPEN_ATTEMPTS}): {e}"
                    );
                    last_error = Some(e);

                    if attempt < MAX_OPEN_ATTEMPTS {
                        thread::sleep(OPEN_RETRY_DELAY);
                    }
                },
            }
        }

        Err(last_error.unwrap_or(Error::DeviceNotFound))
    }
}

impl<T: Read + Write> ConsoleSession<T> {
    /// Wrap an already open transport.
    pub fn new(transport: T) -> Self {
        Self {
            transport: Some(transport),
            pending: Vec::new(),
            unread: String::new(),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        if self.transport.is_some() {
            SessionState::Open
        } else {
            SessionState::Closed
        }
    }

    /// Received text not consumed by any expect step yet.
    pub fn unread(&self) -> &str {
        &self.unread
    }

    /// Access the transport, if still open.
    pub fn transport(&self) -> Option<&T> {
        self.transport.as_ref()
    }

    /// Release the transport. Further steps fail.
    pub fn close(&mut self) -> Option<T> {
        self.pending.clear();
        self.unread.clear();
        self.transport.take()
    }

    /// Run a batch of steps under one overall deadline.
    ///
    /// Returns one [`StepResult`] per expect step. On failure the results of
    /// the steps that completed are kept in the [`BatchError`].
    pub fn run_batch(
        &mut self,
        steps: &[Step],
        timeout: Duration,
    ) -> std::result::Result<Vec<StepResult>, BatchError> {
        let deadline = Instant::now() + timeout;
        let mut results = Vec::new();

        for (index, step) in steps.iter().enumerate() {
            let outcome = match step {
                Step::Send(bytes) => self.send(bytes).map(|()| None),
                Step::Expect(expect) => self
                    .expect(index, expect, deadline)
                    .map(Some),
            };

            match outcome {
                Ok(Some(result)) => results.push(result),
                Ok(None) => {},
                Err(error) => {
                    debug!("Batch failed at step {index}: {error}");
                    return Err(BatchError {
                        error,
                        step: index,
                        results,
                    });
                },
            }
        }

        Ok(results)
    }

    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(closed)?;
        trace!(
            "> {}",
            text::single_line(&String::from_utf8_lossy(bytes))
        );
        transport.write_all(bytes)?;
        transport.flush()?;
        Ok(())
    }

    fn expect(&mut self, index: usize, expect: &Expect, batch_deadline: Instant) -> Result<StepResult> {
        let deadline = expect
            .timeout
            .map_or(batch_deadline, |t| batch_deadline.min(Instant::now() + t));
        if self.transport.is_none() {
            return Err(closed());
        }

        loop {
            if let Some(result) = self.take_match(index, &expect.pattern) {
                debug!(
                    "Matched /{}/: {}",
                    expect.pattern,
                    text::single_line(result.matched())
                );
                return Ok(result);
            }

            if Instant::now() >= deadline {
                return Err(Error::ProtocolTimeout {
                    pattern: expect.pattern.as_str().to_string(),
                    transcript: self.unread.clone(),
                });
            }

            self.fill()?;
        }
    }

    /// Search the unread text and consume it through the end of the match.
    fn take_match(&mut self, index: usize, pattern: &Regex) -> Option<StepResult> {
        let caps = pattern.captures(&self.unread)?;
        let end = caps.get(0)?.end();

        let groups = caps
            .iter()
            .map(|g| g.map(|m| m.as_str().to_string()))
            .collect();
        let named = pattern
            .capture_names()
            .flatten()
            .filter_map(|name| caps.name(name).map(|m| (name.to_string(), m.as_str().to_string())))
            .collect();

        let output: String = self.unread.drain(..end).collect();
        Some(StepResult {
            step: index,
            output,
            groups,
            named,
        })
    }

    /// Read whatever the transport has, waiting at most one poll interval.
    fn fill(&mut self) -> Result<usize> {
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(closed)?;
        let mut buf = [0u8; 512];

        match transport.read(&mut buf) {
            Ok(0) => {
                thread::sleep(IDLE_DELAY);
                Ok(0)
            },
            Ok(n) => {
                self.pending
                    .extend_from_slice(&buf[..n]);
                let decoded = text::drain_utf8_lossy(&mut self.pending);
                trace!("< {}", text::single_line(&decoded));
                self.unread
                    .push_str(&decoded);
                Ok(n)
            },
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(0)
            },
            Err(e) => Err(Error::Io(e)),
        }
    }
}

fn closed() -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::NotConnected,
        "console session closed",
    ))
}
