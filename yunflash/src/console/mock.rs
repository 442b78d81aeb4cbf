//! Scripted in-memory transport for console tests.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::thread;
use std::time::Duration;

/// A fake board console: emits preloaded output and answers written lines.
///
/// Each reply fires once, the first time a written line contains its trigger.
pub(crate) struct ScriptedPort {
    rx: VecDeque<u8>,
    written: Vec<u8>,
    line: Vec<u8>,
    replies: Vec<(String, String)>,
    broken: bool,
}

impl ScriptedPort {
    pub(crate) fn new() -> Self {
        Self {
            rx: VecDeque::new(),
            written: Vec::new(),
            line: Vec::new(),
            replies: Vec::new(),
            broken: false,
        }
    }

    /// Output available before anything is written.
    pub(crate) fn with_output(mut self, text: &str) -> Self {
        self.rx.extend(text.as_bytes());
        self
    }

    /// Answer the next line containing `trigger` with `response`.
    pub(crate) fn on(mut self, trigger: &str, response: &str) -> Self {
        self.replies.push((trigger.to_string(), response.to_string()));
        self
    }

    /// Make every write fail as if the device was unplugged.
    pub(crate) fn broken(mut self) -> Self {
        self.broken = true;
        self
    }

    /// Everything written so far.
    pub(crate) fn sent(&self) -> String {
        String::from_utf8_lossy(&self.written).into_owned()
    }

    fn complete_line(&mut self) {
        let line = String::from_utf8_lossy(&self.line).into_owned();
        self.line.clear();
        if let Some(pos) = self
            .replies
            .iter()
            .position(|(trigger, _)| line.contains(trigger.as_str()))
        {
            let (_, response) = self.replies.remove(pos);
            self.rx.extend(response.as_bytes());
        }
    }
}

impl Read for ScriptedPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.rx.is_empty() {
            thread::sleep(Duration::from_millis(2));
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(self.rx.len());
        for (slot, byte) in buf.iter_mut().zip(self.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for ScriptedPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.broken {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device gone"));
        }
        for &byte in buf {
            self.written.push(byte);
            if byte == b'\n' {
                self.complete_line();
            } else {
                self.line.push(byte);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
