//! Discovery of the host address and a free address for the board.
//!
//! The board is expected to claim an address next to the host on the same
//! broadcast segment. A free address is found by probing hosts upward from a
//! fixed offset; any failed connection counts as "free", so a device that
//! merely refuses the probe port is indistinguishable from an empty slot.

use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::time::Duration;

use log::{debug, info, trace};

use crate::error::{Error, Result};

/// First host number tried for the board.
pub const BOARD_HOST_START: u8 = 24;

/// Timeout of a single liveness probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// TCP port used by the liveness probe.
pub const DEFAULT_PROBE_PORT: u16 = 80;

/// Resolves the host/board address pair.
pub trait AddressNegotiator {
    /// Pick a host address different from `exclude` and a free board address.
    fn negotiate(&mut self, exclude: Option<Ipv4Addr>) -> Result<(Ipv4Addr, Ipv4Addr)>;
}

/// Reachability test for a candidate address.
pub trait LivenessProbe {
    /// Whether something answered at `addr`.
    fn is_alive(&self, addr: Ipv4Addr) -> bool;
}

/// Liveness probe based on a short TCP connection attempt.
#[derive(Debug, Clone, Copy)]
pub struct TcpProbe {
    /// Port to connect to.
    pub port: u16,
    /// Connection timeout.
    pub timeout: Duration,
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self {
            port: DEFAULT_PROBE_PORT,
            timeout: PROBE_TIMEOUT,
        }
    }
}

impl LivenessProbe for TcpProbe {
    fn is_alive(&self, addr: Ipv4Addr) -> bool {
        let target = SocketAddr::from((addr, self.port));
        match TcpStream::connect_timeout(&target, self.timeout) {
            Ok(_) => true,
            Err(e) => {
                trace!("Probe {target}: {e}");
                false
            },
        }
    }
}

/// One IPv4 address of a local network interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddr {
    /// Interface name.
    pub name: String,
    /// Address assigned to the interface.
    pub addr: Ipv4Addr,
    /// Whether the interface is administratively up.
    pub up: bool,
}

/// IPv4 addresses of every local interface.
pub fn list_interface_addrs() -> Vec<InterfaceAddr> {
    netdev::get_interfaces()
        .into_iter()
        .flat_map(|iface| {
            let up = iface.is_up();
            let name = iface.name.clone();
            iface
                .ipv4
                .into_iter()
                .map(move |net| InterfaceAddr {
                    name: name.clone(),
                    addr: net.addr(),
                    up,
                })
        })
        .collect()
}

/// Pick the first usable address of an interface that is up, other than `exclude`.
pub fn select_self_address(interfaces: &[InterfaceAddr], exclude: Option<Ipv4Addr>) -> Result<Ipv4Addr> {
    interfaces
        .iter()
        .filter(|iface| !iface.addr.is_loopback() && !iface.addr.is_unspecified())
        .find(|iface| {
            if !iface.up {
                debug!("Skipping {} on {}: interface down", iface.addr, iface.name);
                false
            } else if Some(iface.addr) == exclude {
                debug!("Skipping {} on {}: excluded", iface.addr, iface.name);
                false
            } else {
                true
            }
        })
        .map(|iface| iface.addr)
        .ok_or_else(|| Error::NetworkUnreachable("are you connected to the network?".into()))
}

/// Probe upward from [`BOARD_HOST_START`] for the first address nobody answers on.
///
/// When every host answers, the last host number reached (255) is returned.
pub fn probe_free_peer<P: LivenessProbe + ?Sized>(self_addr: Ipv4Addr, probe: &P) -> Ipv4Addr {
    let [a, b, c, _] = self_addr.octets();
    let mut host = BOARD_HOST_START;

    while host < u8::MAX {
        let candidate = Ipv4Addr::new(a, b, c, host);
        if candidate != self_addr && !probe.is_alive(candidate) {
            break;
        }
        host += 1;
    }

    Ipv4Addr::new(a, b, c, host)
}

/// Negotiator using the local interfaces and a [`LivenessProbe`].
#[derive(Debug, Clone, Default)]
pub struct LocalNegotiator<P: LivenessProbe = TcpProbe> {
    probe: P,
}

impl<P: LivenessProbe> LocalNegotiator<P> {
    /// Create a negotiator with a custom probe.
    pub fn new(probe: P) -> Self {
        Self { probe }
    }
}

impl<P: LivenessProbe> AddressNegotiator for LocalNegotiator<P> {
    fn negotiate(&mut self, exclude: Option<Ipv4Addr>) -> Result<(Ipv4Addr, Ipv4Addr)> {
        let interfaces = list_interface_addrs();
        trace!("Local interfaces: {interfaces:?}");

        let server = select_self_address(&interfaces, exclude)?;
        let board = probe_free_peer(server, &self.probe);
        info!("Using {server} as server address and {board} as board address");
        Ok((server, board))
    }
}

/// Negotiate addresses with the default TCP probe.
pub fn negotiate(exclude: Option<Ipv4Addr>) -> Result<(Ipv4Addr, Ipv4Addr)> {
    LocalNegotiator::<TcpProbe>::default().negotiate(exclude)
}
