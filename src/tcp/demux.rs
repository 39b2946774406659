use crate::tcp::defs::TcpError;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::ops::RangeInclusive;

// "the Dynamic Ports, also known as the Private or Ephemeral Ports, from 49152-65535 (never assigned)" rfc6335
pub const TCP_EPHEMERAL_PORT_RANGE: RangeInclusive<u16> = 49152..=65535;

/// Local and peer address of one socket. Unspecified addresses and port 0
/// are wildcards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub socket_id: usize,
    pub local: SocketAddrV4,
    pub peer: SocketAddrV4,
    pub rx_enabled: bool,
}

impl Endpoint {
    fn new(socket_id: usize, local: SocketAddrV4) -> Self {
        Self {
            socket_id,
            local,
            peer: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
            rx_enabled: true,
        }
    }

    fn is_connected(&self) -> bool {
        self.peer.port() != 0
    }
}

/// Maps incoming segments to sockets.
///
/// Every endpoint lives in a per local port list. Connected endpoints are
/// additionally indexed by their exact 4-tuple so established traffic skips
/// the specificity scan.
#[derive(Debug)]
pub struct EndpointDemux {
    ephemeral: u16,
    by_port: HashMap<u16, Vec<Endpoint>>,
    by_tuple: HashMap<(SocketAddrV4, SocketAddrV4), usize>,
}

impl Default for EndpointDemux {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointDemux {
    pub fn new() -> Self {
        Self {
            ephemeral: *TCP_EPHEMERAL_PORT_RANGE.start(),
            by_port: HashMap::new(),
            by_tuple: HashMap::new(),
        }
    }

    pub fn lookup_port_local(&self, port: u16) -> bool {
        self.by_port.get(&port).is_some_and(|list| !list.is_empty())
    }

    fn lookup_local(&self, addr: SocketAddrV4) -> bool {
        self.by_port
            .get(&addr.port())
            .is_some_and(|list| list.iter().any(|e| *e.local.ip() == *addr.ip()))
    }

    // Counting up, as netinet/in_pcb.c does.
    fn allocate_ephemeral_port(&mut self) -> Result<u16, TcpError> {
        let first = *TCP_EPHEMERAL_PORT_RANGE.start();
        let last = *TCP_EPHEMERAL_PORT_RANGE.end();
        let mut port = self.ephemeral;
        for _ in 0..=(last - first) {
            port = if port >= last { first } else { port + 1 };
            if !self.lookup_port_local(port) {
                self.ephemeral = port;
                return Ok(port);
            }
        }
        Err(TcpError::NoEphemeralPort)
    }

    /// Binds to `addr` on a fresh ephemeral port.
    pub fn allocate_ephemeral(
        &mut self,
        socket_id: usize,
        addr: Ipv4Addr,
    ) -> Result<SocketAddrV4, TcpError> {
        let port = self.allocate_ephemeral_port()?;
        let local = SocketAddrV4::new(addr, port);
        self.by_port
            .entry(port)
            .or_default()
            .push(Endpoint::new(socket_id, local));
        log::trace!("Allocated ephemeral endpoint {} for socket id={}.", local, socket_id);
        Ok(local)
    }

    /// Binds to an explicit local address and port.
    pub fn allocate(&mut self, socket_id: usize, local: SocketAddrV4) -> Result<(), TcpError> {
        if local.port() == 0 {
            self.allocate_ephemeral(socket_id, *local.ip())?;
            return Ok(());
        }
        if self.lookup_local(local) {
            return Err(TcpError::AddressInUse { addr: local });
        }
        self.by_port
            .entry(local.port())
            .or_default()
            .push(Endpoint::new(socket_id, local));
        Ok(())
    }

    /// Allocates a fully specified endpoint, as for a connection forked from a listener.
    pub fn allocate_connected(
        &mut self,
        socket_id: usize,
        local: SocketAddrV4,
        peer: SocketAddrV4,
    ) -> Result<(), TcpError> {
        let exists = self
            .by_port
            .get(&local.port())
            .is_some_and(|list| list.iter().any(|e| e.local == local && e.peer == peer));
        if exists {
            return Err(TcpError::AddressInUse { addr: local });
        }
        let mut endpoint = Endpoint::new(socket_id, local);
        endpoint.peer = peer;
        self.by_port.entry(local.port()).or_default().push(endpoint);
        self.by_tuple.insert((local, peer), socket_id);
        Ok(())
    }

    /// Connects a bound endpoint, filling in an unspecified local address.
    pub fn set_peer(
        &mut self,
        socket_id: usize,
        local_addr: Ipv4Addr,
        peer: SocketAddrV4,
    ) -> Option<SocketAddrV4> {
        let endpoint = self
            .by_port
            .values_mut()
            .flat_map(|list| list.iter_mut())
            .find(|e| e.socket_id == socket_id)?;
        if endpoint.local.ip().is_unspecified() {
            endpoint.local.set_ip(local_addr);
        }
        endpoint.peer = peer;
        let local = endpoint.local;
        self.by_tuple.insert((local, peer), socket_id);
        Some(local)
    }

    pub fn endpoint(&self, socket_id: usize) -> Option<&Endpoint> {
        self.by_port
            .values()
            .flat_map(|list| list.iter())
            .find(|e| e.socket_id == socket_id)
    }

    pub fn deallocate(&mut self, socket_id: usize) {
        let mut removed = None;
        for list in self.by_port.values_mut() {
            if let Some(pos) = list.iter().position(|e| e.socket_id == socket_id) {
                removed = Some(list.remove(pos));
                break;
            }
        }
        self.by_port.retain(|_, list| !list.is_empty());
        if let Some(endpoint) = removed {
            if endpoint.is_connected() {
                self.by_tuple.remove(&(endpoint.local, endpoint.peer));
            }
            log::trace!(
                "Released endpoint {} -> {} of socket id={}.",
                endpoint.local,
                endpoint.peer,
                socket_id
            );
        }
    }

    /// Finds the socket for a segment from `src` to `dst`, preferring the most specific match:
    /// exact 4-tuple, then all but the local address, then local address and port, then port only.
    pub fn lookup(&self, dst: SocketAddrV4, src: SocketAddrV4) -> Option<usize> {
        if let Some(&socket_id) = self.by_tuple.get(&(dst, src)) {
            return Some(socket_id);
        }

        let mut exact = None;
        let mut all_but_local_addr = None;
        let mut local_only = None;
        let mut port_only = None;
        for endpoint in self.by_port.get(&dst.port())?.iter() {
            if !endpoint.rx_enabled {
                continue;
            }
            let local_exact = endpoint.local.ip() == dst.ip();
            let local_wildcard = endpoint.local.ip().is_unspecified();
            if !local_exact && !local_wildcard {
                continue;
            }
            let peer_port_exact = endpoint.peer.port() == src.port();
            let peer_port_wildcard = endpoint.peer.port() == 0;
            let peer_addr_exact = endpoint.peer.ip() == src.ip();
            let peer_addr_wildcard = endpoint.peer.ip().is_unspecified();
            if !(peer_port_exact || peer_port_wildcard) || !(peer_addr_exact || peer_addr_wildcard)
            {
                continue;
            }

            if local_exact && peer_addr_exact && peer_port_exact {
                exact.get_or_insert(endpoint.socket_id);
            }
            // Bound to any local address but connected to this peer.
            if local_wildcard && peer_addr_exact && peer_port_exact {
                all_but_local_addr.get_or_insert(endpoint.socket_id);
            }
            if local_exact && peer_addr_wildcard && peer_port_wildcard {
                local_only.get_or_insert(endpoint.socket_id);
            }
            if local_wildcard && peer_addr_wildcard && peer_port_wildcard {
                port_only.get_or_insert(endpoint.socket_id);
            }
        }
        exact.or(all_but_local_addr).or(local_only).or(port_only)
    }
}
