//! Read-only TFTP server (RFC 1350) for the bootloader's `tftp` command.
//!
//! Requests arrive on one well-known socket; every read transfer runs on its
//! own thread and ephemeral socket. Writes are refused.

use std::fs::File;
use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};
use log::{debug, error, info, warn};
use num_enum::TryFromPrimitive;

use crate::error::{Error, Result};

/// Well-known TFTP port.
pub const DEFAULT_PORT: u16 = 69;

/// Payload size of a full DATA block.
pub const BLOCK_SIZE: usize = 512;

/// How long to wait for the ACK of a block.
const ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Retransmissions of one block before giving up.
const MAX_RETRANSMITS: usize = 5;

/// How often the request loop checks for shutdown.
const ACCEPT_POLL: Duration = Duration::from_millis(200);

/// Delay before re-binding a failed server.
const RESTART_DELAY: Duration = Duration::from_secs(1);

/// Largest packet accepted on the request socket.
const MAX_PACKET: usize = 4 + BLOCK_SIZE;

#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u16)]
enum Opcode {
    ReadRequest = 1,
    WriteRequest = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
}

/// Error codes carried by ERROR packets.
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u16)]
pub enum ErrorCode {
    /// Not defined, see message.
    NotDefined = 0,
    /// File not found.
    FileNotFound = 1,
    /// Access violation.
    AccessViolation = 2,
    /// Disk full or allocation exceeded.
    DiskFull = 3,
    /// Illegal TFTP operation.
    IllegalOperation = 4,
    /// Unknown transfer ID.
    UnknownTransferId = 5,
    /// File already exists.
    FileAlreadyExists = 6,
    /// No such user.
    NoSuchUser = 7,
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Packet {
    ReadRequest { filename: String, mode: String },
    WriteRequest { filename: String, mode: String },
    Data { block: u16, data: Vec<u8> },
    Ack { block: u16 },
    Error { code: ErrorCode, message: String },
}

/// Split a NUL-terminated string off the front of `buffer`.
fn eat_string(buffer: &mut &[u8]) -> Result<String> {
    let end = buffer
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::Protocol("unterminated TFTP string".into()))?;
    let string = String::from_utf8_lossy(&buffer[..end]).into_owned();
    *buffer = &buffer[end + 1..];
    Ok(string)
}

fn eat_u16(buffer: &mut &[u8]) -> Result<u16> {
    if buffer.len() < 2 {
        return Err(Error::Protocol("truncated TFTP packet".into()));
    }
    let value = BigEndian::read_u16(buffer);
    *buffer = &buffer[2..];
    Ok(value)
}

impl Packet {
    fn parse(mut buffer: &[u8]) -> Result<Self> {
        let raw = eat_u16(&mut buffer)?;
        let opcode =
            Opcode::try_from(raw).map_err(|_| Error::Protocol(format!("unrecognized TFTP opcode {raw}")))?;

        // Request options (RFC 2347) after the mode are ignored.
        let packet = match opcode {
            Opcode::ReadRequest => Self::ReadRequest {
                filename: eat_string(&mut buffer)?,
                mode: eat_string(&mut buffer)?,
            },
            Opcode::WriteRequest => Self::WriteRequest {
                filename: eat_string(&mut buffer)?,
                mode: eat_string(&mut buffer)?,
            },
            Opcode::Data => Self::Data {
                block: eat_u16(&mut buffer)?,
                data: buffer.to_vec(),
            },
            Opcode::Ack => Self::Ack {
                block: eat_u16(&mut buffer)?,
            },
            Opcode::Error => Self::Error {
                code: {
                    let raw = eat_u16(&mut buffer)?;
                    ErrorCode::try_from(raw).map_err(|_| Error::Protocol(format!("unrecognized TFTP error code {raw}")))?
                },
                message: eat_string(&mut buffer).unwrap_or_default(),
            },
        };
        Ok(packet)
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut header = [0u8; 4];
        let mut bytes = Vec::new();

        match self {
            Self::ReadRequest { filename, mode } | Self::WriteRequest { filename, mode } => {
                let opcode = if matches!(self, Self::ReadRequest { .. }) {
                    Opcode::ReadRequest
                } else {
                    Opcode::WriteRequest
                };
                BigEndian::write_u16(&mut header[..2], opcode as u16);
                bytes.extend_from_slice(&header[..2]);
                bytes.extend_from_slice(filename.as_bytes());
                bytes.push(0);
                bytes.extend_from_slice(mode.as_bytes());
                bytes.push(0);
            },
            Self::Data { block, data } => {
                BigEndian::write_u16(&mut header[..2], Opcode::Data as u16);
                BigEndian::write_u16(&mut header[2..], *block);
                bytes.extend_from_slice(&header);
                bytes.extend_from_slice(data);
            },
            Self::Ack { block } => {
                BigEndian::write_u16(&mut header[..2], Opcode::Ack as u16);
                BigEndian::write_u16(&mut header[2..], *block);
                bytes.extend_from_slice(&header);
            },
            Self::Error { code, message } => {
                BigEndian::write_u16(&mut header[..2], Opcode::Error as u16);
                BigEndian::write_u16(&mut header[2..], *code as u16);
                bytes.extend_from_slice(&header);
                bytes.extend_from_slice(message.as_bytes());
                bytes.push(0);
            },
        }

        bytes
    }

    fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }
}

/// Map a requested file name below `root`, refusing anything that escapes it.
fn resolve(root: &Path, filename: &str) -> Option<PathBuf> {
    let relative = Path::new(filename.trim_start_matches('/'));
    let mut components = relative
        .components()
        .peekable();
    components.peek()?;

    if components.all(|c| matches!(c, Component::Normal(_))) {
        Some(root.join(relative))
    } else {
        None
    }
}

/// A bound, not yet running, TFTP server.
#[derive(Debug)]
pub struct TftpServer {
    socket: UdpSocket,
    root: PathBuf,
}

impl TftpServer {
    /// Bind the request socket. Failing here means the service cannot run.
    pub fn bind(addr: SocketAddr, root: impl Into<PathBuf>) -> Result<Self> {
        let socket =
            UdpSocket::bind(addr).map_err(|e| Error::FileServer(format!("cannot listen on {addr}: {e}")))?;
        socket.set_read_timeout(Some(ACCEPT_POLL))?;

        Ok(Self {
            socket,
            root: root.into(),
        })
    }

    /// Address the request socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Run the server on a background thread until the handle is shut down.
    ///
    /// A failing request loop is restarted on a fresh socket.
    pub fn spawn(self) -> Result<TftpHandle> {
        let local_addr = self.local_addr()?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let root = self.root.clone();

        info!("TFTP server listening on {local_addr}, serving {}", root.display());

        let thread = thread::Builder::new()
            .name("tftp".into())
            .spawn(move || {
                let mut current = Some(self);

                while !flag.load(Ordering::SeqCst) {
                    let server = match current.take() {
                        Some(server) => server,
                        None => {
                            thread::sleep(RESTART_DELAY);
                            match Self::bind(local_addr, root.clone()) {
                                Ok(server) => server,
                                Err(e) => {
                                    warn!("TFTP restart failed: {e}");
                                    continue;
                                },
                            }
                        },
                    };

                    match server.serve(&flag) {
                        Ok(()) => break,
                        Err(e) => error!("TFTP server stopped: {e}, restarting"),
                    }
                }
                debug!("TFTP server on {local_addr} shut down");
            })?;

        Ok(TftpHandle {
            local_addr,
            shutdown,
            thread: Some(thread),
        })
    }

    /// Handle requests until `shutdown` is set.
    fn serve(&self, shutdown: &AtomicBool) -> Result<()> {
        let mut buffer = [0u8; MAX_PACKET];

        while !shutdown.load(Ordering::SeqCst) {
            let (size, peer) = match self
                .socket
                .recv_from(&mut buffer)
            {
                Ok(received) => received,
                Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => continue,
                Err(e) => return Err(e.into()),
            };

            match Packet::parse(&buffer[..size]) {
                Ok(packet) => self.dispatch(packet, peer),
                Err(e) => {
                    warn!("Ignoring packet from {peer}: {e}");
                },
            }
        }

        Ok(())
    }

    fn dispatch(&self, packet: Packet, peer: SocketAddr) {
        let reply = match packet {
            Packet::ReadRequest { filename, mode } => {
                if !mode.eq_ignore_ascii_case("octet") && !mode.eq_ignore_ascii_case("netascii") {
                    Packet::error(ErrorCode::IllegalOperation, format!("unsupported mode {mode}"))
                } else if let Some(path) = resolve(&self.root, &filename) {
                    if path.is_file() {
                        self.start_transfer(filename, path, peer);
                        return;
                    }
                    warn!("{peer} requested missing file {filename}");
                    Packet::error(ErrorCode::FileNotFound, "File not found")
                } else {
                    warn!("{peer} requested {filename} outside the served directory");
                    Packet::error(ErrorCode::AccessViolation, "Access violation")
                }
            },
            Packet::WriteRequest { filename, .. } => {
                warn!("{peer} tried to write {filename}");
                Packet::error(ErrorCode::AccessViolation, "Server is read-only")
            },
            other => {
                debug!("Unexpected packet from {peer}: {other:?}");
                Packet::error(ErrorCode::IllegalOperation, "Illegal TFTP operation")
            },
        };

        if let Err(e) = self
            .socket
            .send_to(&reply.to_bytes(), peer)
        {
            warn!("Failed to answer {peer}: {e}");
        }
    }

    fn start_transfer(&self, filename: String, path: PathBuf, peer: SocketAddr) {
        let local_ip = self
            .socket
            .local_addr()
            .map_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED), |a| a.ip());

        let spawned = thread::Builder::new()
            .name(format!("tftp-{peer}"))
            .spawn(move || match send_file(&path, local_ip, peer) {
                Ok(bytes) => info!("Sent {filename} to {peer} ({bytes} bytes)"),
                Err(e) => warn!("Transfer of {filename} to {peer} failed: {e}"),
            });

        if let Err(e) = spawned {
            error!("Cannot start transfer thread: {e}");
        }
    }
}

/// Send one file to `peer` from an ephemeral socket. Returns the bytes sent.
fn send_file(path: &Path, local_ip: IpAddr, peer: SocketAddr) -> Result<u64> {
    let bind_ip = if local_ip.is_unspecified() {
        match peer {
            SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    } else {
        local_ip
    };
    let socket = UdpSocket::bind(SocketAddr::new(bind_ip, 0))?;
    socket.connect(peer)?;

    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) => {
            let _ = socket.send(&Packet::error(ErrorCode::NotDefined, e.to_string()).to_bytes());
            return Err(e.into());
        },
    };

    let mut block: u16 = 1;
    let mut sent = 0u64;

    loop {
        let mut data = Vec::with_capacity(BLOCK_SIZE);
        (&mut file)
            .take(BLOCK_SIZE as u64)
            .read_to_end(&mut data)?;
        let len = data.len();

        send_block(&socket, &Packet::Data { block, data }.to_bytes(), block, ACK_TIMEOUT)?;
        sent += len as u64;

        if len < BLOCK_SIZE {
            return Ok(sent);
        }
        block = block.wrapping_add(1);
    }
}

/// Send a DATA packet until its ACK arrives, retransmitting on timeout.
fn send_block(socket: &UdpSocket, packet: &[u8], block: u16, ack_timeout: Duration) -> Result<()> {
    let mut buffer = [0u8; MAX_PACKET];

    for attempt in 0..=MAX_RETRANSMITS {
        if attempt > 0 {
            debug!("Retransmitting block {block} (attempt {attempt}/{MAX_RETRANSMITS})");
        }
        socket.send(packet)?;

        let deadline = Instant::now() + ack_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            socket.set_read_timeout(Some(remaining))?;

            let size = match socket.recv(&mut buffer) {
                Ok(size) => size,
                Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => break,
                Err(e) => return Err(e.into()),
            };

            match Packet::parse(&buffer[..size]) {
                Ok(Packet::Ack { block: acked }) if acked == block => return Ok(()),
                // Duplicate ACK of an earlier block; keep waiting.
                Ok(Packet::Ack { .. }) => {},
                Ok(Packet::Error { code, message }) => {
                    return Err(Error::FileServer(format!("peer aborted with {code:?}: {message}")));
                },
                Ok(other) => debug!("Unexpected packet during transfer: {other:?}"),
                Err(e) => debug!("Malformed packet during transfer: {e}"),
            }
        }
    }

    Err(Error::FileServer(format!("no ACK for block {block}")))
}

/// Handle to a running [`TftpServer`].
#[derive(Debug)]
pub struct TftpHandle {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl TftpHandle {
    /// Address the server listens on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting requests and wait for the request loop to exit.
    ///
    /// Transfers already running finish on their own threads.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown
            .store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for TftpHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
