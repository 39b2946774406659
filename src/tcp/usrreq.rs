use crate::config::{CongestionKind, StackConfig};
use crate::tcp::{
    congestion::new_congestion_ops,
    defs::{TcpError, TcpStatus},
    demux::EndpointDemux,
    input::{ListenQueue, TcpConnection, TcpEventType},
    output::{EcnCodepoint, OutSegment},
    packet::{TcpFlag, TcpPacket},
    seq::SequenceNumber32,
};
use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Instant;

const TCP_MAX_LISTEN_QUEUE: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct TcpEvent {
    pub socket_id: usize,
    pub event: TcpEventType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TcpRead {
    Data(Vec<u8>),
    /// Nothing buffered yet.
    Empty,
    /// The peer closed and every byte before its FIN was read.
    EndOfStream,
}

/// All sockets of one host.
///
/// The stack does no I/O of its own. Segments to send are collected with
/// `poll_transmit`, received ones are handed to `input`, and `next_timeout`
/// tells the owner when to call `handle_timeout`.
#[derive(Debug)]
pub struct TcpStack {
    pub config: StackConfig,
    local_addr: Ipv4Addr,
    connections: HashMap<usize, TcpConnection>,
    listen_queue: HashMap<usize, ListenQueue>,
    demux: EndpointDemux,
    // Closed by the application, dropped once released.
    orphans: HashSet<usize>,
    events: VecDeque<TcpEvent>,
    transmit: VecDeque<OutSegment>,
    next_socket_id: usize,
    rng: StdRng,
    epoch: Instant,
}

impl TcpStack {
    pub fn new(config: StackConfig, local_addr: Ipv4Addr, now: Instant) -> Self {
        Self::with_rng(config, local_addr, StdRng::from_entropy(), now)
    }

    /// Same as `new` with reproducible initial sequence numbers.
    pub fn with_seed(config: StackConfig, local_addr: Ipv4Addr, seed: u64, now: Instant) -> Self {
        Self::with_rng(config, local_addr, StdRng::seed_from_u64(seed), now)
    }

    fn with_rng(config: StackConfig, local_addr: Ipv4Addr, rng: StdRng, now: Instant) -> Self {
        Self {
            config,
            local_addr,
            connections: HashMap::new(),
            listen_queue: HashMap::new(),
            demux: EndpointDemux::new(),
            orphans: HashSet::new(),
            events: VecDeque::new(),
            transmit: VecDeque::new(),
            next_socket_id: 1,
            rng,
            epoch: now,
        }
    }

    pub fn local_addr(&self) -> Ipv4Addr {
        self.local_addr
    }

    fn generate_socket_id(&mut self) -> usize {
        let id = self.next_socket_id;
        self.next_socket_id += 1;
        id
    }

    // rfc6528 asks for a keyed hash plus a clock; a random ISS serves a simulated host.
    fn generate_initial_sequence(&mut self) -> SequenceNumber32 {
        SequenceNumber32::new(self.rng.gen::<u32>())
    }

    fn connection_mut(&mut self, socket_id: usize) -> Result<&mut TcpConnection> {
        self.connections
            .get_mut(&socket_id)
            .ok_or(TcpError::NoSuchSocket { id: socket_id })
            .context("Socket lookup failed.")
    }

    pub fn connection(&self, socket_id: usize) -> Option<&TcpConnection> {
        self.connections.get(&socket_id)
    }

    pub fn status(&self, socket_id: usize) -> Option<TcpStatus> {
        self.connections.get(&socket_id).map(|conn| conn.status)
    }

    /// Opens a socket with the configured congestion control.
    pub fn socket(&mut self) -> usize {
        self.socket_with(self.config.tcp.congestion_control)
    }

    pub fn socket_with(&mut self, kind: CongestionKind) -> usize {
        let socket_id = self.generate_socket_id();
        let cong = new_congestion_ops(kind, &self.config);
        let conn = TcpConnection::new(socket_id, &self.config.tcp, cong, self.epoch);
        self.connections.insert(socket_id, conn);
        log::debug!(
            "Tcp socket (id={}) created with {:?} congestion control.",
            socket_id,
            kind
        );
        socket_id
    }

    pub fn bind(&mut self, socket_id: usize, addr: SocketAddrV4) -> Result<()> {
        let conn = self.connection_mut(socket_id)?;
        if conn.status != TcpStatus::Closed || conn.released {
            anyhow::bail!(TcpError::InvalidState {
                id: socket_id,
                status: conn.status
            });
        }
        if self.demux.endpoint(socket_id).is_some() {
            anyhow::bail!("Tcp socket (id={}) is already bound.", socket_id);
        }
        self.demux
            .allocate(socket_id, addr)
            .with_context(|| format!("Failed to bind tcp socket (id={}) to {}.", socket_id, addr))?;
        if let Some(endpoint) = self.demux.endpoint(socket_id) {
            let local = endpoint.local;
            if let Some(conn) = self.connections.get_mut(&socket_id) {
                conn.local = local;
            }
            log::info!("Tcp socket (id={}) bound to {}.", socket_id, local);
        }
        Ok(())
    }

    pub fn listen(&mut self, socket_id: usize) -> Result<()> {
        let bound = self.demux.endpoint(socket_id).is_some();
        let conn = self.connection_mut(socket_id)?;
        if !bound {
            anyhow::bail!(
                "Cannot listen Socket (id={}) which is not bound.",
                socket_id
            );
        }
        if conn.status != TcpStatus::Closed {
            anyhow::bail!(
                "Only a Closed socket can transit to Listen. Current: {}",
                conn.status
            );
        }
        conn.status = TcpStatus::Listen;
        log::debug!("{} CLOSED -> LISTEN", conn.print_log_prefix());
        self.listen_queue.insert(socket_id, ListenQueue::new());
        Ok(())
    }

    /// Takes the oldest established connection of a listener, if any.
    pub fn accept(&mut self, socket_id: usize) -> Result<Option<(usize, SocketAddrV4)>> {
        let queue = self
            .listen_queue
            .get_mut(&socket_id)
            .with_context(|| format!("Socket (id={}) is not listening.", socket_id))?;
        let Some(child_id) = queue.established_unconsumed.pop_front() else {
            return Ok(None);
        };
        queue.accepted += 1;
        let conn = self.connection_mut(child_id)?;
        conn.parent_id = None;
        log::info!("{} Accepted.", conn.print_log_prefix());
        let remote = conn.remote_addr();
        // Data that arrived before accept was not reported.
        if conn.rx_buffer.available() > 0 || conn.rx_buffer.finished() {
            self.publish_event(child_id, TcpEventType::DataAvailable);
        }
        Ok(Some((child_id, remote)))
    }

    /// Starts an active open. Completion is reported as `Connected`.
    pub fn connect(&mut self, socket_id: usize, remote: SocketAddrV4, now: Instant) -> Result<()> {
        let conn = self.connection_mut(socket_id)?;
        if conn.status != TcpStatus::Closed || conn.released {
            anyhow::bail!(TcpError::InvalidState {
                id: socket_id,
                status: conn.status
            });
        }
        if self.demux.endpoint(socket_id).is_none() {
            self.demux
                .allocate_ephemeral(socket_id, self.local_addr)
                .context("Failed to allocate an ephemeral port.")?;
        }
        let local = self
            .demux
            .set_peer(socket_id, self.local_addr, remote)
            .with_context(|| format!("Socket (id={}) is not bound.", socket_id))?;
        let iss = self.generate_initial_sequence();

        let conn = self.connection_mut(socket_id)?;
        conn.local = local;
        conn.remote = remote;
        conn.initialize_sequence(iss);
        conn.status = TcpStatus::SynSent;
        log::debug!(
            "{} CLOSED -> SYN-SENT. ISS={}.",
            conn.print_log_prefix(),
            iss
        );
        let flags = conn.syn_flags();
        conn.send_empty_packet(flags, now);
        self.flush(socket_id);
        Ok(())
    }

    /// Queues as much of `data` as the send buffer takes and returns that amount.
    pub fn send(&mut self, socket_id: usize, data: &[u8], now: Instant) -> Result<usize> {
        let conn = self.connection_mut(socket_id)?;
        if conn.shutdown_send {
            anyhow::bail!(TcpError::ShutdownSend { id: socket_id });
        }
        if !matches!(
            conn.status,
            TcpStatus::SynSent | TcpStatus::SynRcvd | TcpStatus::Established | TcpStatus::CloseWait
        ) {
            anyhow::bail!(TcpError::NotConnected { id: socket_id });
        }
        let available = conn.tx_buffer.available() as usize;
        if available == 0 && !data.is_empty() {
            anyhow::bail!(TcpError::BufferFull {
                requested: data.len(),
                available
            });
        }
        let len = data.len().min(available);
        if !conn.tx_buffer.add(&data[..len]) {
            anyhow::bail!(TcpError::BufferFull {
                requested: len,
                available
            });
        }
        log::trace!("WRITE CALL: id={} len={}", socket_id, len);
        if matches!(conn.status, TcpStatus::Established | TcpStatus::CloseWait) {
            conn.send_pending_data(conn.connected, now);
        }
        self.flush(socket_id);
        Ok(len)
    }

    /// Reads up to `max_size` in-order bytes.
    pub fn recv(&mut self, socket_id: usize, max_size: usize, now: Instant) -> Result<TcpRead> {
        let conn = self.connection_mut(socket_id)?;
        if conn.shutdown_recv {
            return Ok(TcpRead::EndOfStream);
        }
        let previous_window = conn.adv_wnd;
        let read = match conn.rx_buffer.extract(max_size as u32) {
            Some(data) => {
                log::trace!("READ CALL: id={} len={}", socket_id, data.len());
                if !conn.released {
                    conn.send_window_update(previous_window, now);
                }
                TcpRead::Data(data)
            }
            None if conn.rx_buffer.finished() || conn.released => TcpRead::EndOfStream,
            None => TcpRead::Empty,
        };
        self.flush(socket_id);
        Ok(read)
    }

    /// Closes the socket. Unread data aborts the connection with a RST;
    /// unsent data goes out first and the FIN follows it.
    pub fn close(&mut self, socket_id: usize, now: Instant) -> Result<()> {
        let conn = self.connection_mut(socket_id)?;
        log::trace!("CLOSE CALL: {}", conn.print_log_prefix());
        match conn.status {
            TcpStatus::Closed | TcpStatus::Listen | TcpStatus::SynSent => {
                conn.close_notified = true;
                conn.deallocate_endpoint();
            }
            _ if conn.released => {}
            _ if conn.rx_buffer.size() != 0 => {
                log::warn!(
                    "{} Closed with unread data, resetting.",
                    conn.print_log_prefix()
                );
                conn.send_rst(now);
            }
            _ if conn.tx_buffer.size_from_sequence(conn.tcb.next_tx_seq) > 0 => {
                if !conn.close_on_empty {
                    conn.close_on_empty = true;
                    log::info!("{} Deferring close.", conn.print_log_prefix());
                }
            }
            _ => conn.do_close(now),
        }
        conn.shutdown_send = true;
        self.orphans.insert(socket_id);
        if let Some(queue) = self.listen_queue.remove(&socket_id) {
            for child in queue.pending.iter().chain(queue.established_unconsumed.iter()) {
                self.orphans.insert(*child);
                if let Some(child_conn) = self.connections.get_mut(child) {
                    child_conn.send_rst(now);
                }
            }
            let children: Vec<usize> = queue
                .pending
                .into_iter()
                .chain(queue.established_unconsumed)
                .collect();
            for child in children {
                self.flush(child);
            }
        }
        self.flush(socket_id);
        Ok(())
    }

    /// Half close: no more data is accepted and a FIN follows what is queued.
    pub fn shutdown_send(&mut self, socket_id: usize, now: Instant) -> Result<()> {
        let conn = self.connection_mut(socket_id)?;
        conn.shutdown_send = true;
        conn.close_on_empty = true;
        if conn.tx_buffer.size_from_sequence(conn.tcb.next_tx_seq) == 0
            && matches!(conn.status, TcpStatus::Established | TcpStatus::CloseWait)
        {
            log::info!("{} Nothing left to send, FIN now.", conn.print_log_prefix());
            conn.do_close(now);
        }
        self.flush(socket_id);
        Ok(())
    }

    pub fn shutdown_recv(&mut self, socket_id: usize) -> Result<()> {
        self.connection_mut(socket_id)?.shutdown_recv = true;
        Ok(())
    }

    pub fn poll_event(&mut self) -> Option<TcpEvent> {
        self.events.pop_front()
    }

    pub fn poll_transmit(&mut self) -> Option<OutSegment> {
        self.transmit.pop_front()
    }

    /// Dispatches a received segment from `src` to `dst`.
    pub fn input(
        &mut self,
        src: SocketAddrV4,
        dst: SocketAddrV4,
        packet: &TcpPacket,
        ecn: EcnCodepoint,
        now: Instant,
    ) {
        let Some(socket_id) = self.demux.lookup(dst, src) else {
            log::debug!(
                "No socket for {} -> {}, {}",
                src,
                dst,
                packet.print_general_info()
            );
            self.reply_rst(src, dst, packet);
            return;
        };
        let listening = self
            .connections
            .get(&socket_id)
            .is_some_and(|conn| conn.status == TcpStatus::Listen);
        if listening {
            self.listen_handler(socket_id, src, dst, packet, now);
            return;
        }
        if let Some(conn) = self.connections.get_mut(&socket_id) {
            conn.input_segment(packet, ecn, now);
        }
        self.flush(socket_id);
    }

    fn reply_rst(&mut self, src: SocketAddrV4, dst: SocketAddrV4, packet: &TcpPacket) {
        if packet.flag.contains(TcpFlag::RST) {
            return;
        }
        let rst = if packet.flag.contains(TcpFlag::ACK) {
            packet.create_rst()
        } else {
            packet.create_rst_ack()
        };
        self.transmit.push_back(OutSegment::new(dst, src, rst));
    }

    // 3.10.7.2 LISTEN STATE rfc9293
    fn listen_handler(
        &mut self,
        socket_id: usize,
        src: SocketAddrV4,
        dst: SocketAddrV4,
        packet: &TcpPacket,
        now: Instant,
    ) {
        if packet.flag.contains(TcpFlag::RST) {
            return;
        }
        // "Any acknowledgment is bad if it arrives on a connection still in the LISTEN state." rfc9293
        if packet.flag.contains(TcpFlag::ACK) {
            self.reply_rst(src, dst, packet);
            return;
        }
        if !packet.flag.contains(TcpFlag::SYN) {
            return;
        }
        let backlog = self
            .listen_queue
            .get(&socket_id)
            .map_or(0, |q| q.pending.len() + q.established_unconsumed.len());
        if backlog >= TCP_MAX_LISTEN_QUEUE {
            log::warn!(
                "Listen queue of socket (id={}) is full, SYN from {} dropped.",
                socket_id,
                src
            );
            return;
        }

        let child_id = self.generate_socket_id();
        let Some(listener) = self.connections.get(&socket_id) else {
            return;
        };
        let mut child = listener.fork(child_id);
        if let Err(e) = self.demux.allocate_connected(child_id, dst, src) {
            log::warn!("Failed to fork socket (id={}): {}", socket_id, e);
            return;
        }
        let iss = self.generate_initial_sequence();
        child.complete_fork(packet, dst, src, iss, now);
        log::debug!(
            "{} Forked from listening socket (id={}).",
            child.print_log_prefix(),
            socket_id
        );
        self.connections.insert(child_id, child);
        if let Some(queue) = self.listen_queue.get_mut(&socket_id) {
            queue.pending.push_back(child_id);
        }
        self.flush(child_id);
    }

    fn publish_event(&mut self, socket_id: usize, event: TcpEventType) {
        log::trace!("Publish event {:?} for socket (id={}).", event, socket_id);
        self.events.push_back(TcpEvent { socket_id, event });
    }

    // Moves what a connection produced to the stack and reaps released sockets.
    fn flush(&mut self, socket_id: usize) {
        let Some(conn) = self.connections.get_mut(&socket_id) else {
            return;
        };
        self.transmit.extend(conn.transmit.drain(..));
        let events: Vec<TcpEventType> = conn.events.drain(..).collect();
        let parent_id = conn.parent_id;
        let released = conn.released;

        for event in events {
            match (parent_id, event) {
                (Some(parent), TcpEventType::Accepted) => {
                    if let Some(queue) = self.listen_queue.get_mut(&parent) {
                        queue.pending.retain(|&id| id != socket_id);
                        queue.established_unconsumed.push_back(socket_id);
                        self.publish_event(parent, TcpEventType::Accepted);
                    }
                }
                // Nobody can see a child before accept, except through its data.
                (Some(_), TcpEventType::DataAvailable | TcpEventType::SendBufferSpace(_)) => {}
                (Some(_), event) => {
                    log::debug!(
                        "Unaccepted socket (id={}) reported {:?}.",
                        socket_id,
                        event
                    );
                }
                (None, event) => self.publish_event(socket_id, event),
            }
        }

        if released {
            self.demux.deallocate(socket_id);
            if let Some(parent) = parent_id {
                if let Some(queue) = self.listen_queue.get_mut(&parent) {
                    queue.remove(socket_id);
                }
                self.orphans.insert(socket_id);
            }
            if self.orphans.remove(&socket_id) {
                self.connections.remove(&socket_id);
                log::debug!("Tcp socket (id={}) released.", socket_id);
            }
        }
    }

    pub fn next_timeout(&self) -> Option<Instant> {
        self.connections
            .values()
            .filter_map(|conn| conn.next_timeout())
            .min()
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        let mut due: Vec<usize> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.next_timeout().is_some_and(|at| at <= now))
            .map(|(&id, _)| id)
            .collect();
        due.sort_unstable();
        for socket_id in due {
            if let Some(conn) = self.connections.get_mut(&socket_id) {
                conn.handle_timeout(now);
            }
            self.flush(socket_id);
        }
    }

    /// Reports that a segment from `poll_transmit` left the qdisc.
    pub fn on_segment_departed(&mut self, segment: &OutSegment, now: Instant) {
        let Some(socket_id) = segment.socket_id else {
            return;
        };
        if let Some(conn) = self.connections.get_mut(&socket_id) {
            conn.on_segment_departed(segment, now);
        }
        self.flush(socket_id);
    }

    /// Reports that the qdisc refused a segment from `poll_transmit`.
    pub fn on_segment_dropped(&mut self, segment: &OutSegment, now: Instant) {
        let Some(socket_id) = segment.socket_id else {
            return;
        };
        if let Some(conn) = self.connections.get_mut(&socket_id) {
            conn.on_segment_dropped(segment, now);
        }
        self.flush(socket_id);
    }
}
