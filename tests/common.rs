#![allow(dead_code)]

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};
use tcpcc_r::config::{CongestionKind, StackConfig};
use tcpcc_r::fq::{FqDequeue, FqScheduler};
use tcpcc_r::sched::{EventQueue, Scheduler};
use tcpcc_r::tcp::input::TcpEventType;
use tcpcc_r::tcp::output::OutSegment;
use tcpcc_r::tcp::packet::{TcpFlag, TcpPacket};
use tcpcc_r::tcp::usrreq::{TcpEvent, TcpRead, TcpStack};

pub const CLIENT: usize = 0;
pub const SERVER: usize = 1;
pub const CLIENT_ADDR: Ipv4Addr = Ipv4Addr::new(172, 20, 10, 100);
pub const SERVER_ADDR: Ipv4Addr = Ipv4Addr::new(172, 20, 10, 110);
pub const SERVER_PORT: u16 = 2000;
// Bound on loop iterations so a stuck timer fails the test instead of hanging it.
const MAX_STEPS: usize = 2_000_000;

#[derive(Debug)]
pub enum NetEvent {
    Deliver { to: usize, segment: OutSegment },
}

/// A segment as it left a host's qdisc.
#[derive(Debug, Clone)]
pub struct Trace {
    pub at: Instant,
    pub from: usize,
    pub flags: TcpFlag,
    /// Payload offset in the sender's byte stream, 0 is the first data byte.
    pub offset: Option<u32>,
    pub len: usize,
    pub dropped: bool,
}

pub struct Host {
    pub stack: TcpStack,
    pub qdisc: FqScheduler<OutSegment>,
    pub events: Vec<TcpEvent>,
    qdisc_wake: Option<Instant>,
    link_free_at: Instant,
    // ISS of this host's connection, learned from its SYN.
    iss: Option<u32>,
}

/// Two hosts joined by a point to point link.
pub struct Network {
    pub clock: EventQueue<NetEvent>,
    pub hosts: [Host; 2],
    pub delay: Duration,
    /// Link rate in bytes per second, `None` for no serialization delay.
    pub rate: Option<u64>,
    /// (sender, stream offset) of data segments to drop once.
    pub drop_once: HashSet<(usize, u32)>,
    /// Drop everything a host sends.
    pub blackhole: [bool; 2],
    pub trace: Vec<Trace>,
}

impl Network {
    pub fn new(config: StackConfig, delay: Duration) -> Self {
        let start = Instant::now();
        let host = |addr, seed| Host {
            stack: TcpStack::with_seed(config.clone(), addr, seed, start),
            qdisc: FqScheduler::new(config.fq.clone()),
            events: Vec::new(),
            qdisc_wake: None,
            link_free_at: start,
            iss: None,
        };
        Self {
            clock: EventQueue::new(start),
            hosts: [host(CLIENT_ADDR, 1), host(SERVER_ADDR, 2)],
            delay,
            rate: None,
            drop_once: HashSet::new(),
            blackhole: [false, false],
            trace: Vec::new(),
        }
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    pub fn stack(&mut self, host: usize) -> &mut TcpStack {
        &mut self.hosts[host].stack
    }

    // Moves segments from the stacks into their qdiscs and from the qdiscs onto the link,
    // until neither has anything to hand over at the current time.
    fn pump(&mut self) -> Result<()> {
        let now = self.now();
        for from in [CLIENT, SERVER] {
            loop {
                let host = &mut self.hosts[from];
                while let Some(event) = host.stack.poll_event() {
                    host.events.push(event);
                }
                while let Some(segment) = host.stack.poll_transmit() {
                    if let Err(drop) = host.qdisc.enqueue(segment, now) {
                        host.stack.on_segment_dropped(&drop.item, now);
                    }
                }

                host.qdisc_wake = None;
                let mut sent = false;
                while self.hosts[from].link_free_at <= now {
                    match self.hosts[from].qdisc.dequeue(now) {
                        FqDequeue::Ready(segment) => {
                            self.transmit(from, segment, now)?;
                            sent = true;
                        }
                        FqDequeue::Throttled(at) => {
                            self.hosts[from].qdisc_wake = Some(at);
                            break;
                        }
                        FqDequeue::Empty => break,
                    }
                }
                let host = &mut self.hosts[from];
                if !host.qdisc.is_empty() && host.qdisc_wake.is_none() {
                    host.qdisc_wake = Some(host.link_free_at);
                }
                if !sent {
                    break;
                }
            }
        }
        Ok(())
    }

    fn transmit(&mut self, from: usize, segment: OutSegment, now: Instant) -> Result<()> {
        let to = 1 - from;
        let host = &mut self.hosts[from];
        host.stack.on_segment_departed(&segment, now);
        let serialization = match self.rate {
            Some(rate) => Duration::from_nanos(segment.wire_size() as u64 * 1_000_000_000 / rate),
            None => Duration::ZERO,
        };
        host.link_free_at = now + serialization;

        let packet = &segment.packet;
        if packet.flag.contains(TcpFlag::SYN) {
            host.iss = Some(packet.seq_number.value());
        }
        let offset = match (packet.payload.is_empty(), host.iss) {
            (false, Some(iss)) => Some(packet.seq_number.value().wrapping_sub(iss.wrapping_add(1))),
            _ => None,
        };
        let dropped = self.blackhole[from]
            || offset.is_some_and(|offset| self.drop_once.remove(&(from, offset)));
        self.trace.push(Trace {
            at: now,
            from,
            flags: packet.flag,
            offset,
            len: packet.payload.len(),
            dropped,
        });
        if dropped {
            log::debug!("Link dropped {}", packet.print_general_info());
            return Ok(());
        }

        // Through the wire format and back.
        let mut wire = segment.packet.clone();
        let bytes = wire.create_packet();
        let mut received = segment.clone();
        received.packet = TcpPacket::new();
        received
            .packet
            .read(&bytes)
            .context("Segment did not survive the wire format.")?;
        self.clock.schedule_at(
            now + serialization + self.delay,
            NetEvent::Deliver {
                to,
                segment: received,
            },
        );
        Ok(())
    }

    fn next_wakeup(&mut self) -> Option<Instant> {
        let timers = self
            .hosts
            .iter()
            .flat_map(|host| [host.stack.next_timeout(), host.qdisc_wake])
            .flatten()
            .min();
        match (timers, self.clock.peek_time()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Runs until `deadline` or until `stop` holds.
    pub fn run_while<F>(&mut self, deadline: Instant, mut stop: F) -> Result<bool>
    where
        F: FnMut(&mut Network) -> bool,
    {
        for _ in 0..MAX_STEPS {
            self.pump()?;
            if stop(self) {
                return Ok(true);
            }
            let Some(next) = self.next_wakeup().filter(|&at| at <= deadline) else {
                self.clock.pop_until(deadline);
                return Ok(false);
            };
            match self.clock.pop_until(next) {
                Some((now, NetEvent::Deliver { to, segment })) => {
                    self.hosts[to].stack.input(
                        segment.src,
                        segment.dst,
                        &segment.packet,
                        segment.ecn,
                        now,
                    );
                }
                None => {
                    let now = self.now();
                    for host in self.hosts.iter_mut() {
                        host.stack.handle_timeout(now);
                    }
                }
            }
        }
        anyhow::bail!("Simulation did not settle in {} steps.", MAX_STEPS)
    }

    pub fn run_for(&mut self, duration: Duration) -> Result<()> {
        let deadline = self.now() + duration;
        self.run_while(deadline, |_| false)?;
        Ok(())
    }

    /// Runs until `host` reports an event matching `pred`, which is returned.
    pub fn wait_event<F>(&mut self, host: usize, timeout: Duration, pred: F) -> Result<TcpEvent>
    where
        F: Fn(&TcpEvent) -> bool,
    {
        let deadline = self.now() + timeout;
        let found = self.run_while(deadline, |net| net.hosts[host].events.iter().any(&pred))?;
        anyhow::ensure!(found, "Host {} saw no expected event in {:?}.", host, timeout);
        let events = &mut self.hosts[host].events;
        let pos = events
            .iter()
            .position(&pred)
            .context("Event vanished.")?;
        Ok(events.remove(pos))
    }

    /// Opens a client socket connected to a listening server socket and
    /// returns (client id, accepted server id).
    pub fn establish(&mut self) -> Result<(usize, usize)> {
        let kind = self.hosts[CLIENT].stack.config.tcp.congestion_control;
        self.establish_with(SERVER_PORT, kind)
    }

    pub fn establish_with(&mut self, port: u16, kind: CongestionKind) -> Result<(usize, usize)> {
        let now = self.now();
        let listener = self.stack(SERVER).socket_with(kind);
        self.stack(SERVER)
            .bind(listener, SocketAddrV4::new(SERVER_ADDR, port))?;
        self.stack(SERVER).listen(listener)?;
        let client = self.stack(CLIENT).socket_with(kind);
        self.stack(CLIENT)
            .connect(client, SocketAddrV4::new(SERVER_ADDR, port), now)?;
        self.wait_event(CLIENT, Duration::from_secs(10), |e| {
            e.socket_id == client && e.event == TcpEventType::Connected
        })?;
        self.wait_event(SERVER, Duration::from_secs(10), |e| {
            e.socket_id == listener && e.event == TcpEventType::Accepted
        })?;
        let (server, _) = self
            .stack(SERVER)
            .accept(listener)?
            .context("Nothing to accept.")?;
        Ok((client, server))
    }

    /// Writes all of `data`, running the network whenever the send buffer is full.
    pub fn send_all(&mut self, host: usize, socket_id: usize, data: &[u8]) -> Result<()> {
        let mut offset = 0;
        while offset < data.len() {
            let now = self.now();
            let available = self
                .stack(host)
                .connection(socket_id)
                .map_or(0, |conn| conn.tx_buffer.available());
            if available == 0 {
                self.run_for(Duration::from_millis(1))?;
                continue;
            }
            offset += self.stack(host).send(socket_id, &data[offset..], now)?;
        }
        Ok(())
    }

    /// Reads until `len` bytes arrived or `timeout` passes.
    pub fn recv_exact(
        &mut self,
        host: usize,
        socket_id: usize,
        len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let deadline = self.now() + timeout;
        let mut received = Vec::with_capacity(len);
        while received.len() < len {
            let now = self.now();
            match self.stack(host).recv(socket_id, len - received.len(), now)? {
                TcpRead::Data(data) => received.extend(data),
                TcpRead::EndOfStream => break,
                TcpRead::Empty => {
                    anyhow::ensure!(
                        now < deadline,
                        "Received {} of {} bytes before the deadline.",
                        received.len(),
                        len
                    );
                    self.run_while(deadline, |net| {
                        net.hosts[host]
                            .stack
                            .connection(socket_id)
                            .map_or(true, |conn| {
                                conn.rx_buffer.available() > 0 || conn.rx_buffer.finished()
                            })
                    })?;
                }
            }
        }
        Ok(received)
    }

    /// Streams `data` from one socket to the other, writing and reading as
    /// buffer space allows, and returns what the receiver read.
    pub fn transfer(
        &mut self,
        (from, sender): (usize, usize),
        (to, receiver): (usize, usize),
        data: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let deadline = self.now() + timeout;
        let mut sent = 0;
        let mut received = Vec::with_capacity(data.len());
        while received.len() < data.len() {
            anyhow::ensure!(
                self.now() < deadline,
                "Transferred {} of {} bytes before the deadline.",
                received.len(),
                data.len()
            );
            let now = self.now();
            let space = self
                .stack(from)
                .connection(sender)
                .map_or(0, |conn| conn.tx_buffer.available());
            if sent < data.len() && space > 0 {
                sent += self.stack(from).send(sender, &data[sent..], now)?;
            }
            match self.stack(to).recv(receiver, data.len() - received.len(), now)? {
                TcpRead::Data(chunk) => received.extend(chunk),
                TcpRead::EndOfStream => break,
                TcpRead::Empty => self.run_for(Duration::from_millis(1))?,
            }
        }
        Ok(received)
    }

    /// Retransmitted data segments seen on the link from `host`.
    pub fn retransmissions(&self, host: usize) -> Vec<&Trace> {
        let mut seen = HashSet::new();
        self.trace
            .iter()
            .filter(|t| t.from == host && t.len > 0)
            .filter(|t| !seen.insert(t.offset))
            .collect()
    }
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}
