use crate::config::TcpConfig;
use crate::tcp::{
    congestion::{CongestionOps, ControlBlock},
    defs::{EcnState, TcpCaEvent, TcpCongState, TcpError, TcpStatus},
    output::{EcnCodepoint, OutSegment},
    packet::{SackBlock, TcpFlag, TcpOptionTimestamp, TcpPacket, TCP_MAX_WINDOW_SHIFT},
    rate::RateSampler,
    recovery::PrrRecovery,
    rx_buffer::RxBuffer,
    seq::SequenceNumber32,
    timer::{RttEstimator, TcpTimer, TcpTimerKind},
    tx_buffer::{RackParams, TxBuffer, TxSegment},
};
use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

/// What a connection reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum TcpEventType {
    Connected,
    ConnectionFailed,
    /// Handshake of a connection forked from a listener completed.
    Accepted,
    DataAvailable,
    /// Free bytes in the send buffer.
    SendBufferSpace(u32),
    /// The peer's FIN has been consumed in order.
    PeerClosed,
    Closed,
    Error(TcpError),
}

#[derive(Debug, Default)]
pub struct ListenQueue {
    pub pending: VecDeque<usize>, // Received SYN, handshake in progress
    pub established_unconsumed: VecDeque<usize>, // Established but not used by accept call
    pub accepted: usize,
}

impl ListenQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remove(&mut self, socket_id: usize) {
        self.pending.retain(|&id| id != socket_id);
        self.established_unconsumed.retain(|&id| id != socket_id);
    }
}

// Send times of the segments one ACK delivered, cumulatively or by SACK.
#[derive(Debug, Default)]
struct AckedSegments {
    first_sent: Option<Instant>,
    last_sent: Option<Instant>,
    retransmitted: bool,
    segments: u32,
}

impl AckedSegments {
    fn delivered(&mut self, segment: &TxSegment) {
        self.segments += 1;
        if segment.retrans {
            self.retransmitted = true;
            return;
        }
        if segment.rtt_unreliable {
            return;
        }
        if let Some(sent) = segment.last_sent {
            self.first_sent = Some(self.first_sent.map_or(sent, |t| t.min(sent)));
            self.last_sent = Some(self.last_sent.map_or(sent, |t| t.max(sent)));
        }
    }
}

#[derive(Debug)]
pub struct TcpConnection {
    pub socket_id: usize,
    pub parent_id: Option<usize>,
    pub local: SocketAddrV4,
    pub remote: SocketAddrV4,
    pub status: TcpStatus,
    pub config: TcpConfig,
    pub tcb: ControlBlock,
    pub tx_buffer: TxBuffer,
    pub rx_buffer: RxBuffer,
    pub cong: Box<dyn CongestionOps>,
    pub(crate) prr: PrrRecovery,
    pub rate: RateSampler,
    pub timer: TcpTimer,
    pub rtt: RttEstimator,
    /// Flags of the SYN or FIN the retransmission timer re-sends.
    pub(crate) retx_flags: Option<TcpFlag>,
    /// Peer receive window, already scaled.
    pub rwnd: u32,
    pub(crate) iss: SequenceNumber32,
    pub(crate) high_rx_mark: SequenceNumber32, // highest seq received, for window updates
    pub(crate) high_rx_ack_mark: SequenceNumber32, // highest ack received
    pub(crate) high_tx_ack: SequenceNumber32, // highest ack sent
    pub(crate) adv_wnd: u32,
    pub(crate) snd_wind_shift: u8,
    pub(crate) rcv_wind_shift: u8,
    pub(crate) win_scaling_enabled: bool,
    pub sack_enabled: bool,
    pub(crate) timestamp_enabled: bool,
    pub(crate) ts_to_echo: u32,
    pub(crate) syn_count: u32,
    pub(crate) data_retr_count: u32,
    // Cleared when the SYN is retransmitted, Karn's rule.
    pub(crate) syn_sent_time: Option<Instant>,
    pub(crate) del_ack_count: u32,
    pub(crate) del_ack_max: u32,
    pub(crate) persist_timeout: Duration,
    pub(crate) recover: SequenceNumber32,
    pub(crate) recover_active: bool,
    pub(crate) dup_ack_count: u32,
    pub(crate) bytes_acked_not_processed: u32,
    pub(crate) ecn_echo_seq: SequenceNumber32,
    pub(crate) ecn_ce_seq: SequenceNumber32,
    pub(crate) ecn_cwr_seq: SequenceNumber32,
    pub(crate) cwnd_usage_seq: SequenceNumber32,
    pub(crate) pace_initial_window: bool,
    /// Data bytes handed to the qdisc and not yet departed.
    pub(crate) bytes_in_qdisc: u32,
    pub(crate) close_notified: bool,
    pub(crate) close_on_empty: bool,
    pub(crate) shutdown_send: bool,
    pub(crate) shutdown_recv: bool,
    pub connected: bool,
    /// No longer bound to an endpoint, ignores segments and timers.
    pub released: bool,
    pub(crate) transmit: VecDeque<OutSegment>,
    pub(crate) events: VecDeque<TcpEventType>,
    pub(crate) epoch: Instant,
}

impl TcpConnection {
    pub fn new(
        socket_id: usize,
        config: &TcpConfig,
        cong: Box<dyn CongestionOps>,
        epoch: Instant,
    ) -> Self {
        let unspecified = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
        let zero = SequenceNumber32::default();
        let mut tx_buffer = TxBuffer::new(config.snd_buf_size, zero);
        tx_buffer.set_sack_enabled(config.sack);
        Self {
            socket_id,
            parent_id: None,
            local: unspecified,
            remote: unspecified,
            status: TcpStatus::Closed,
            config: config.clone(),
            tcb: ControlBlock::new(config),
            tx_buffer,
            rx_buffer: RxBuffer::new(config.rcv_buf_size, zero),
            cong,
            prr: PrrRecovery::new(),
            rate: RateSampler::new(),
            timer: TcpTimer::default(),
            rtt: RttEstimator::new(config),
            retx_flags: None,
            rwnd: 0,
            iss: zero,
            high_rx_mark: zero,
            high_rx_ack_mark: zero,
            high_tx_ack: zero,
            adv_wnd: 0,
            snd_wind_shift: 0,
            rcv_wind_shift: 0,
            win_scaling_enabled: config.window_scaling,
            sack_enabled: config.sack,
            timestamp_enabled: config.timestamps,
            ts_to_echo: 0,
            syn_count: config.syn_retries,
            data_retr_count: config.data_retries,
            syn_sent_time: None,
            del_ack_count: 0,
            del_ack_max: config.delayed_ack_count,
            persist_timeout: config.persist_timeout,
            recover: zero,
            recover_active: false,
            dup_ack_count: 0,
            bytes_acked_not_processed: 0,
            ecn_echo_seq: zero,
            ecn_ce_seq: zero,
            ecn_cwr_seq: zero,
            cwnd_usage_seq: zero,
            pace_initial_window: config.pace_initial_window,
            bytes_in_qdisc: 0,
            close_notified: false,
            close_on_empty: false,
            shutdown_send: false,
            shutdown_recv: false,
            connected: false,
            released: false,
            transmit: VecDeque::new(),
            events: VecDeque::new(),
            epoch,
        }
    }

    /// Copy of a listening socket for one incoming connection.
    pub fn fork(&self, socket_id: usize) -> Self {
        let mut child = Self::new(socket_id, &self.config, self.cong.fork(), self.epoch);
        child.parent_id = Some(self.socket_id);
        child.local = self.local;
        child
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local
    }

    pub fn remote_addr(&self) -> SocketAddrV4 {
        self.remote
    }

    pub fn print_log_prefix(&self) -> String {
        format!(
            "id={} status={} local={} remote={}",
            self.socket_id, self.status, self.local, self.remote
        )
    }

    pub(crate) fn notify(&mut self, event: TcpEventType) {
        log::trace!("{} Notify {:?}.", self.print_log_prefix(), event);
        self.events.push_back(event);
    }

    pub fn poll_event(&mut self) -> Option<TcpEventType> {
        self.events.pop_front()
    }

    pub fn poll_transmit(&mut self) -> Option<OutSegment> {
        self.transmit.pop_front()
    }

    /// The SYN takes `iss`, data starts right after it.
    pub(crate) fn initialize_sequence(&mut self, iss: SequenceNumber32) {
        self.iss = iss;
        self.tcb.next_tx_seq = iss;
        self.tcb.high_tx_mark = iss;
        self.tcb.last_acked_seq = iss;
        self.high_rx_ack_mark = iss;
        self.recover = iss;
        self.ecn_echo_seq = iss;
        self.ecn_cwr_seq = iss;
        self.cwnd_usage_seq = iss;
        self.tx_buffer.set_head_sequence(iss + 1);
    }

    /// rfc6675 pipe, as the scoreboard counts it.
    pub(crate) fn bytes_in_flight(&self) -> u32 {
        self.tx_buffer.bytes_in_flight()
    }

    pub(crate) fn update_bytes_in_flight(&mut self) {
        self.tcb.bytes_in_flight = self.tx_buffer.bytes_in_flight();
        self.tcb.total_lost = self.tx_buffer.total_lost();
    }

    pub(crate) fn rack_params(&self, now: Instant) -> RackParams {
        RackParams {
            now,
            min_rtt: self.tcb.min_rtt,
            srtt: self.rtt.srtt(),
            cong_state: self.tcb.cong_state,
        }
    }

    pub(crate) fn cwnd_event(&mut self, event: TcpCaEvent, now: Instant) {
        self.cong
            .cwnd_event(&mut self.tcb, event, &self.rate.conn, now);
    }

    pub(crate) fn cong_state_set(&mut self, state: TcpCongState, now: Instant) {
        if self.tcb.cong_state == state {
            return;
        }
        self.cong
            .cong_state_set(&mut self.tcb, state, &self.rate.conn, now);
        log::debug!(
            "{} {} -> {}",
            self.print_log_prefix(),
            self.tcb.cong_state,
            state
        );
        self.tcb.cong_state = state;
    }

    pub(crate) fn cancel_retransmission(&mut self) {
        self.timer.stop(TcpTimerKind::Retransmission);
        self.retx_flags = None;
    }

    /// Entry point for a segment addressed to this connection.
    pub fn input_segment(&mut self, packet: &TcpPacket, ecn: EcnCodepoint, now: Instant) {
        if self.released {
            return;
        }
        log::trace!(
            "{} Received {}",
            self.print_log_prefix(),
            packet.print_general_info()
        );
        let seq = packet.seq_number;
        let tail = seq + packet.payload.len() as u32;
        if !packet.payload.is_empty() && self.out_of_range(seq, tail) {
            log::debug!(
                "{} Segment {}..{} is out of the receive window ({}..{}), dropped.",
                self.print_log_prefix(),
                seq,
                tail,
                self.rx_buffer.next_rx_sequence(),
                self.rx_buffer.max_rx_sequence()
            );
            // "If an incoming segment is not acceptable, an acknowledgment should be sent in reply" rfc9293
            if !packet.flag.contains(TcpFlag::RST) {
                self.send_empty_packet(TcpFlag::ACK, now);
            }
            return;
        }

        if self.tcb.ecn_state != EcnState::Disabled {
            if ecn == EcnCodepoint::Ce && self.ecn_ce_seq < seq {
                log::debug!(
                    "{} Received CE, {:?} -> CeRcvd",
                    self.print_log_prefix(),
                    self.tcb.ecn_state
                );
                self.ecn_ce_seq = seq;
                self.tcb.ecn_state = EcnState::CeRcvd;
                self.cwnd_event(TcpCaEvent::EcnIsCe, now);
            } else if ecn != EcnCodepoint::NotEct {
                self.cwnd_event(TcpCaEvent::EcnNoCe, now);
            }
        }

        self.do_forward_up(packet, now);
    }

    fn do_forward_up(&mut self, packet: &TcpPacket, now: Instant) {
        if packet.flag.contains(TcpFlag::RST) {
            self.recv_handler_rst(packet);
            return;
        }

        if packet.flag.contains(TcpFlag::ACK)
            && !packet.flag.contains(TcpFlag::SYN)
            && self.status >= TcpStatus::Established
            && self.status != TcpStatus::TimeWait
            && packet.ack_number > self.max_acceptable_ack()
        {
            // "If the ACK acks something not yet sent (SEG.ACK > SND.NXT), then send an ACK, drop the segment, and return." rfc9293
            log::debug!(
                "{} ACK {} beyond {}, dropped.",
                self.print_log_prefix(),
                packet.ack_number,
                self.max_acceptable_ack()
            );
            self.send_ack_with_ece(now);
            return;
        }

        if self.status == TcpStatus::Established
            && packet.flag.contains(TcpFlag::CWR)
            && !matches!(self.tcb.ecn_state, EcnState::Disabled | EcnState::CeRcvd)
        {
            // The sender reacted to our echo.
            self.tcb.ecn_state = EcnState::Idle;
        }

        if packet.flag.contains(TcpFlag::SYN) {
            self.process_syn_options(packet);
        } else if packet.flag.contains(TcpFlag::ACK) {
            if self.timestamp_enabled {
                match packet.option.timestamps {
                    Some(ts) => self.process_option_timestamp(&ts, packet.seq_number),
                    None => {
                        // "If a non-RST segment is received without a TSopt, a TCP SHOULD silently drop the segment." rfc7323
                        log::debug!(
                            "{} Segment without timestamps, dropped.",
                            self.print_log_prefix()
                        );
                        return;
                    }
                }
            }
            self.update_window_size(packet);
        }

        if self.connected && self.rwnd == 0 && !self.timer.is_running(TcpTimerKind::Persist) {
            log::debug!(
                "{} Peer window is zero, persist in {:?}.",
                self.print_log_prefix(),
                self.persist_timeout
            );
            self.cancel_retransmission();
            self.timer
                .set(TcpTimerKind::Persist, now + self.persist_timeout);
        }

        match self.status {
            TcpStatus::Established => self.recv_handler_established(packet, now),
            TcpStatus::SynSent => self.recv_handler_syn_sent(packet, now),
            TcpStatus::SynRcvd => self.recv_handler_syn_rcvd(packet, now),
            TcpStatus::FinWait1 | TcpStatus::FinWait2 | TcpStatus::CloseWait => {
                self.recv_handler_wait(packet, now)
            }
            TcpStatus::Closing => self.recv_handler_closing(packet, now),
            TcpStatus::LastAck => self.recv_handler_last_ack(packet, now),
            TcpStatus::Closed => {
                log::debug!(
                    "{} Segment for a closed socket, reply RST.",
                    self.print_log_prefix()
                );
                self.reply_rst(packet);
            }
            // Listeners are forked by the stack, TIME-WAIT only waits.
            TcpStatus::Listen | TcpStatus::TimeWait => {}
        }

        if self.released {
            return;
        }
        if self.rwnd != 0 && self.timer.is_running(TcpTimerKind::Persist) {
            log::debug!("{} Peer window reopened.", self.print_log_prefix());
            self.timer.stop(TcpTimerKind::Persist);
            self.persist_timeout = self.config.persist_timeout;
            if self.bytes_in_flight() > 0 && !self.timer.is_running(TcpTimerKind::Retransmission)
            {
                self.timer
                    .set(TcpTimerKind::Retransmission, now + self.rtt.rto());
            }
            self.send_pending_data(self.connected, now);
        }
    }

    /// Reply for a segment nobody owns: <SEQ=SEG.ACK><CTL=RST>, or
    /// <SEQ=0><ACK=SEG.SEQ+SEG.LEN><CTL=RST,ACK> when it carries no ACK.
    pub(crate) fn reply_rst(&mut self, packet: &TcpPacket) {
        if packet.flag.contains(TcpFlag::RST) {
            return;
        }
        let rst = if packet.flag.contains(TcpFlag::ACK) {
            packet.create_rst()
        } else {
            packet.create_rst_ack()
        };
        self.transmit
            .push_back(OutSegment::new(self.local, self.remote, rst));
    }

    // 3.10.7.3 / 3.10.7.4 reset processing rfc9293
    fn recv_handler_rst(&mut self, packet: &TcpPacket) {
        let acceptable = match self.status {
            // "If the ACK bit is set, If SEG.ACK =< ISS or SEG.ACK > SND.NXT ... drop the segment" rfc9293
            TcpStatus::SynSent => {
                packet.flag.contains(TcpFlag::ACK) && packet.ack_number == self.iss + 1
            }
            TcpStatus::Listen | TcpStatus::Closed | TcpStatus::TimeWait => false,
            _ => {
                let next = self.rx_buffer.next_rx_sequence();
                packet.seq_number == next
                    || (packet.seq_number > next
                        && packet.seq_number < self.rx_buffer.max_rx_sequence())
            }
        };
        if !acceptable {
            log::debug!(
                "{} Ignored unacceptable RST {}.",
                self.print_log_prefix(),
                packet.print_general_info()
            );
            return;
        }
        let error = if self.status == TcpStatus::SynSent {
            TcpError::ConnectionRefused {
                id: self.socket_id,
                addr: self.remote,
            }
        } else {
            TcpError::ConnectionReset {
                id: self.socket_id,
                addr: self.remote,
            }
        };
        log::info!("{} Reset by peer.", self.print_log_prefix());
        self.notify(TcpEventType::Error(error));
        self.close_notified = true;
        self.close_and_notify();
    }

    // 3.10.7.3 SYN-SENT STATE rfc9293
    fn recv_handler_syn_sent(&mut self, packet: &TcpPacket, now: Instant) {
        let flags = packet
            .flag
            .difference(TcpFlag::PSH | TcpFlag::URG | TcpFlag::ECE | TcpFlag::CWR);
        if flags == TcpFlag::SYN {
            // Simultaneous open.
            log::debug!("{} SYN-SENT -> SYN-RCVD", self.print_log_prefix());
            self.status = TcpStatus::SynRcvd;
            self.syn_count = self.config.syn_retries;
            self.syn_sent_time = None;
            self.cancel_retransmission();
            self.rx_buffer.set_next_rx_sequence(packet.seq_number + 1);
            self.reply_syn_ack(packet, now);
        } else if flags == TcpFlag::SYN | TcpFlag::ACK && packet.ack_number == self.iss + 1 {
            self.syn_ack_rtt_measure(now);
            self.rx_buffer.set_next_rx_sequence(packet.seq_number + 1);
            self.connection_established(now);
            self.tcb.ecn_state = if self.config.ecn
                && packet.flag.intersection(TcpFlag::ECE | TcpFlag::CWR) == TcpFlag::ECE
            {
                EcnState::Idle
            } else {
                EcnState::Disabled
            };
            log::info!("{} Connection established.", self.print_log_prefix());
            self.send_empty_packet(TcpFlag::ACK, now);
            self.del_ack_count = self.del_ack_max;
            self.notify(TcpEventType::Connected);
            let available = self.tx_buffer.available();
            if available > 0 {
                self.notify(TcpEventType::SendBufferSpace(available));
            }
            self.send_pending_data(self.connected, now);
        } else if flags.contains(TcpFlag::ACK) && !flags.contains(TcpFlag::SYN) {
            // "If SEG.ACK =< ISS or SEG.ACK > SND.NXT, send a reset" rfc9293
            if packet.ack_number != self.iss + 1 {
                self.reply_rst(packet);
            }
        } else {
            log::debug!(
                "{} Unexpected segment in SYN-SENT, reset. {}",
                self.print_log_prefix(),
                packet.print_general_info()
            );
            self.send_rst(now);
        }
    }

    pub(crate) fn reply_syn_ack(&mut self, packet: &TcpPacket, now: Instant) {
        if self.config.ecn && packet.flag.contains(TcpFlag::ECE | TcpFlag::CWR) {
            self.tcb.ecn_state = EcnState::Idle;
            self.send_empty_packet(TcpFlag::SYN | TcpFlag::ACK | TcpFlag::ECE, now);
        } else {
            self.tcb.ecn_state = EcnState::Disabled;
            self.send_empty_packet(TcpFlag::SYN | TcpFlag::ACK, now);
        }
    }

    /// Second half of the fork: the child answers the SYN its listener received.
    pub(crate) fn complete_fork(
        &mut self,
        packet: &TcpPacket,
        local: SocketAddrV4,
        remote: SocketAddrV4,
        iss: SequenceNumber32,
        now: Instant,
    ) {
        self.local = local;
        self.remote = remote;
        self.initialize_sequence(iss);
        self.process_syn_options(packet);
        log::debug!("{} LISTEN -> SYN-RCVD", self.print_log_prefix());
        self.status = TcpStatus::SynRcvd;
        self.rx_buffer.set_next_rx_sequence(packet.seq_number + 1);
        self.reply_syn_ack(packet, now);
    }

    // 3.10.7.4 SYN-RECEIVED STATE rfc9293
    fn recv_handler_syn_rcvd(&mut self, packet: &TcpPacket, now: Instant) {
        let flags = packet
            .flag
            .difference(TcpFlag::PSH | TcpFlag::URG | TcpFlag::ECE | TcpFlag::CWR);
        if flags.is_empty()
            || (flags == TcpFlag::ACK && packet.ack_number == self.tcb.next_tx_seq + 1)
        {
            self.syn_ack_rtt_measure(now);
            self.connection_established(now);
            log::info!("{} Connection established.", self.print_log_prefix());
            // Answer the first data segment at once.
            self.del_ack_count = self.del_ack_max;
            self.notify(TcpEventType::Accepted);
            if flags.contains(TcpFlag::ACK) {
                self.received_ack(packet, now);
            } else if !packet.payload.is_empty() {
                self.received_data(packet, now);
            }
        } else if flags == TcpFlag::SYN {
            // Our SYN-ACK was lost.
            self.rx_buffer.set_next_rx_sequence(packet.seq_number + 1);
            self.reply_syn_ack(packet, now);
        } else if flags == TcpFlag::FIN | TcpFlag::ACK
            && packet.seq_number == self.rx_buffer.next_rx_sequence()
        {
            // The final ACK of the handshake was lost, the FIN completes it.
            self.connection_established(now);
            self.notify(TcpEventType::Accepted);
            self.peer_close(packet, now);
        } else if flags.contains(TcpFlag::ACK) && packet.ack_number != self.tcb.next_tx_seq + 1 {
            // "If the segment acknowledgment is not acceptable, form a reset segment" rfc9293
            self.reply_rst(packet);
        } else {
            log::debug!(
                "{} Unexpected segment in SYN-RCVD, reset. {}",
                self.print_log_prefix(),
                packet.print_general_info()
            );
            self.send_rst(now);
        }
    }

    fn syn_ack_rtt_measure(&mut self, now: Instant) {
        if let Some(sent) = self.syn_sent_time.take() {
            let m = now.saturating_duration_since(sent);
            self.rtt_sample(m, m);
        }
    }

    fn connection_established(&mut self, now: Instant) {
        self.status = TcpStatus::Established;
        self.connected = true;
        self.cancel_retransmission();
        self.syn_sent_time = None;
        self.tcb.next_tx_seq = self.iss + 1;
        self.tcb.high_tx_mark = self.iss + 1;
        self.tcb.last_acked_seq = self.iss + 1;
        self.cwnd_usage_seq = self.iss + 1;
        self.recover = self.iss + 1;
        self.high_tx_ack = self.rx_buffer.next_rx_sequence();
        self.tx_buffer.set_sack_enabled(self.sack_enabled);
        self.cong.init(&mut self.tcb, &self.rate.conn, now);
        self.update_pacing_rate();
    }

    // 3.10.7.4 Other states rfc9293
    fn recv_handler_established(&mut self, packet: &TcpPacket, now: Instant) {
        let flags = packet
            .flag
            .difference(TcpFlag::PSH | TcpFlag::URG | TcpFlag::CWR | TcpFlag::ECE);
        if flags == TcpFlag::ACK {
            if packet.ack_number < self.tx_buffer.head_sequence() {
                log::trace!(
                    "{} Ignored old ACK {} (head {}).",
                    self.print_log_prefix(),
                    packet.ack_number,
                    self.tx_buffer.head_sequence()
                );
                return;
            }
            self.received_ack(packet, now);
        } else if flags == TcpFlag::SYN || flags == TcpFlag::SYN | TcpFlag::ACK {
            // Retransmitted handshake, already answered.
        } else if flags == TcpFlag::FIN || flags == TcpFlag::FIN | TcpFlag::ACK {
            if flags.contains(TcpFlag::ACK) && packet.ack_number >= self.tx_buffer.head_sequence() {
                self.process_ack(packet, now);
            }
            self.peer_close(packet, now);
        } else if flags.is_empty() {
            self.received_data(packet, now);
            if self.rx_buffer.finished() {
                self.peer_close(packet, now);
            }
        } else {
            log::debug!(
                "{} Unexpected flags {:?}, reset.",
                self.print_log_prefix(),
                packet.flag
            );
            self.send_rst(now);
        }
    }

    // FIN-WAIT-1, FIN-WAIT-2 and CLOSE-WAIT
    fn recv_handler_wait(&mut self, packet: &TcpPacket, now: Instant) {
        let flags = packet
            .flag
            .difference(TcpFlag::PSH | TcpFlag::URG | TcpFlag::CWR | TcpFlag::ECE);
        if !flags.contains(TcpFlag::ACK) && !flags.contains(TcpFlag::FIN) && !flags.contains(TcpFlag::SYN)
        {
            if !packet.payload.is_empty() {
                self.received_data(packet, now);
            }
        } else if flags == TcpFlag::ACK {
            self.received_ack(packet, now);
            if self.status == TcpStatus::FinWait1
                && self.tx_buffer.size() == 0
                && packet.ack_number == self.tcb.high_tx_mark + 1
            {
                log::debug!("{} FIN-WAIT-1 -> FIN-WAIT-2", self.print_log_prefix());
                self.status = TcpStatus::FinWait2;
                self.cancel_retransmission();
            }
        } else if flags == TcpFlag::FIN || flags == TcpFlag::FIN | TcpFlag::ACK {
            if flags.contains(TcpFlag::ACK) {
                self.received_ack(packet, now);
            } else if !packet.payload.is_empty() {
                self.received_data(packet, now);
            }
            if self.released {
                return;
            }
            self.rx_buffer
                .set_fin_sequence(packet.seq_number + packet.payload.len() as u32);
            if self.status == TcpStatus::CloseWait {
                // Retransmitted FIN, our ACK was lost.
                self.send_empty_packet(TcpFlag::ACK, now);
            }
        } else if flags.contains(TcpFlag::SYN) {
            return;
        } else {
            self.send_rst(now);
            return;
        }
        if self.released {
            return;
        }

        if matches!(self.status, TcpStatus::FinWait1 | TcpStatus::FinWait2)
            && self.rx_buffer.finished()
        {
            let fin_acked = self.tx_buffer.size() == 0
                && packet.flag.contains(TcpFlag::ACK)
                && packet.ack_number == self.tcb.high_tx_mark + 1;
            if self.status == TcpStatus::FinWait1 && !fin_acked {
                log::debug!("{} FIN-WAIT-1 -> CLOSING", self.print_log_prefix());
                self.status = TcpStatus::Closing;
            } else {
                self.time_wait(now);
            }
            self.send_empty_packet(TcpFlag::ACK, now);
            if !self.shutdown_recv {
                self.notify(TcpEventType::PeerClosed);
            }
        }
    }

    // 3.10.7.4 CLOSING STATE rfc9293
    fn recv_handler_closing(&mut self, packet: &TcpPacket, now: Instant) {
        let flags = packet.flag.difference(TcpFlag::PSH | TcpFlag::URG);
        if flags == TcpFlag::ACK {
            if packet.seq_number == self.rx_buffer.next_rx_sequence()
                && packet.ack_number == self.tcb.high_tx_mark + 1
            {
                // Our FIN is acknowledged.
                self.time_wait(now);
            }
            return;
        }
        // Both sides already sent FIN, anything but their FIN is a protocol error.
        if flags == TcpFlag::FIN || flags == TcpFlag::FIN | TcpFlag::ACK {
            self.send_empty_packet(TcpFlag::ACK, now);
            self.close_and_notify();
        } else {
            self.send_rst(now);
        }
    }

    // 3.10.7.4 LAST-ACK STATE rfc9293
    fn recv_handler_last_ack(&mut self, packet: &TcpPacket, now: Instant) {
        let flags = packet.flag.difference(TcpFlag::PSH | TcpFlag::URG);
        if flags.is_empty() {
            self.received_data(packet, now);
        } else if flags == TcpFlag::ACK {
            if packet.ack_number == self.tcb.high_tx_mark + 1 && self.tx_buffer.size() == 0 {
                log::info!("{} FIN acknowledged.", self.print_log_prefix());
                self.close_and_notify();
            } else {
                self.received_ack(packet, now);
                if !self.released
                    && packet.ack_number == self.tcb.high_tx_mark + 1
                    && self.tx_buffer.size() == 0
                {
                    self.close_and_notify();
                }
            }
        } else if flags == TcpFlag::FIN {
            self.send_empty_packet(TcpFlag::FIN | TcpFlag::ACK, now);
        } else if flags == TcpFlag::FIN | TcpFlag::ACK {
            self.close_and_notify();
        } else {
            self.send_rst(now);
        }
    }

    fn peer_close(&mut self, packet: &TcpPacket, now: Instant) {
        let seq = packet.seq_number;
        if seq < self.rx_buffer.next_rx_sequence() || seq > self.rx_buffer.max_rx_sequence() {
            return;
        }
        let fin_seq = seq + packet.payload.len() as u32;
        self.rx_buffer.set_fin_sequence(fin_seq);
        log::debug!("{} Accepted FIN at {}.", self.print_log_prefix(), fin_seq);
        if !packet.payload.is_empty() {
            self.received_data(packet, now);
        }
        if self.released || !self.rx_buffer.finished() {
            return;
        }
        if self.status == TcpStatus::FinWait1 {
            log::debug!("{} FIN-WAIT-1 -> CLOSING", self.print_log_prefix());
            self.status = TcpStatus::Closing;
            self.send_empty_packet(TcpFlag::ACK, now);
            return;
        }
        self.do_peer_close(now);
    }

    fn do_peer_close(&mut self, now: Instant) {
        log::debug!("{} -> CLOSE-WAIT", self.print_log_prefix());
        self.status = TcpStatus::CloseWait;
        self.notify(TcpEventType::PeerClosed);
        if self.shutdown_send && self.tx_buffer.size_from_sequence(self.tcb.next_tx_seq) == 0
        {
            // The application already finished sending, our FIN follows.
            self.do_close(now);
        } else {
            self.send_empty_packet(TcpFlag::ACK, now);
        }
    }

    fn received_ack(&mut self, packet: &TcpPacket, now: Instant) {
        self.process_ack(packet, now);
        if self.released {
            return;
        }
        if !packet.payload.is_empty() {
            self.received_data(packet, now);
        }
        if self.released {
            return;
        }
        self.send_pending_data(self.connected, now);
    }

    fn received_data(&mut self, packet: &TcpPacket, now: Instant) {
        let seq = packet.seq_number;
        let expected = self.rx_buffer.next_rx_sequence();
        if !self.rx_buffer.add(seq, &packet.payload) {
            // Duplicate or outside the buffer, tell the peer where we are.
            self.send_ack_with_ece(now);
            return;
        }
        if self.high_rx_mark < seq + packet.payload.len() as u32 {
            self.high_rx_mark = seq + packet.payload.len() as u32;
        }
        let advanced = self.rx_buffer.next_rx_sequence() != expected;
        if advanced && !self.shutdown_recv {
            self.notify(TcpEventType::DataAvailable);
        }

        if expected == self.rx_buffer.next_rx_sequence() {
            // Out of order, a hole remains: ACK at once.
            if expected < seq {
                self.send_ack_with_ece(now);
            }
        } else if expected + packet.payload.len() as u32 != self.rx_buffer.next_rx_sequence() {
            // A hole was filled.
            self.send_ack_with_ece(now);
        } else {
            self.del_ack_count += 1;
            if self.del_ack_count >= self.del_ack_max {
                self.timer.stop(TcpTimerKind::DelayedAck);
                self.del_ack_count = 0;
                self.cwnd_event(TcpCaEvent::NonDelayedAck, now);
                self.send_ack_with_ece(now);
            } else if !self.timer.is_running(TcpTimerKind::DelayedAck) {
                self.timer.set(
                    TcpTimerKind::DelayedAck,
                    now + self.config.delayed_ack_timeout,
                );
            }
        }

        // A FIN that arrived early becomes in order once the hole is filled.
        if self.rx_buffer.finished() && !packet.flag.contains(TcpFlag::FIN) {
            match self.status {
                TcpStatus::Established | TcpStatus::SynRcvd => self.do_peer_close(now),
                TcpStatus::FinWait1 | TcpStatus::FinWait2 => {
                    let fin_acked = self.tx_buffer.size() == 0
                        && packet.ack_number == self.tcb.high_tx_mark + 1;
                    if self.status == TcpStatus::FinWait2 || fin_acked {
                        self.time_wait(now);
                    } else {
                        self.status = TcpStatus::Closing;
                    }
                    self.send_empty_packet(TcpFlag::ACK, now);
                    self.notify(TcpEventType::PeerClosed);
                }
                _ => {}
            }
        }
    }

    fn process_ack(&mut self, packet: &TcpPacket, now: Instant) {
        let ack = packet.ack_number;
        let old_head = self.tx_buffer.head_sequence();
        let prior_in_flight = self.bytes_in_flight();
        let previous_lost = self.tx_buffer.lost_out();
        let previous_delivered = self.rate.conn.delivered;
        self.rate.begin_ack();

        let mut sacked = AckedSegments::default();
        let bytes_sacked = self.process_option_sack(packet, &mut sacked, now);
        if ack < old_head {
            log::trace!(
                "{} Stale ACK {} below head {}.",
                self.print_log_prefix(),
                ack,
                old_head
            );
            return;
        }
        let acked = self.discard_acked(ack, now);
        let current_delivered = (self.rate.conn.delivered - previous_delivered) as u32;
        let rtt_sample = self.ack_update_rtt(packet, &acked, &sacked, now);
        self.rate.sample.rtt = rtt_sample;
        self.update_bytes_in_flight();

        if self.tcb.cong_state == TcpCongState::Cwr && ack > self.recover {
            // Window reduction done, a new ECE may start another one below.
            self.cong_state_set(TcpCongState::Open, now);
            if !self.cong.has_cong_control() {
                self.prr.exit_recovery(&mut self.tcb);
                self.cwnd_event(TcpCaEvent::CompleteCwr, now);
            }
        }

        if self.tcb.ecn_state != EcnState::Disabled && packet.flag.contains(TcpFlag::ECE) {
            if ack > old_head && self.ecn_echo_seq < ack {
                log::debug!(
                    "{} ECN echo at {}, {:?} -> EceRcvd",
                    self.print_log_prefix(),
                    ack,
                    self.tcb.ecn_state
                );
                self.ecn_echo_seq = ack;
                self.tcb.ecn_state = EcnState::EceRcvd;
                if self.tcb.cong_state < TcpCongState::Cwr {
                    self.enter_cwr(current_delivered, now);
                }
            }
        } else if self.tcb.ecn_state == EcnState::EceRcvd {
            self.tcb.ecn_state = EcnState::Idle;
        }

        let is_dupack = if self.sack_enabled {
            bytes_sacked > 0
        } else {
            ack == old_head && ack < self.tcb.high_tx_mark
        };
        let old_dup_ack_count = self.dup_ack_count;
        self.tcb.last_acked_seq = ack;
        if is_dupack {
            self.dup_ack(current_delivered, now);
        }

        if ack == old_head && ack == self.tcb.high_tx_mark {
            // Nothing outstanding: a window update or a repeated ACK.
        } else if ack == old_head && ack > self.tcb.high_tx_mark {
            // Acknowledges our FIN only.
            self.tcb.next_tx_seq = ack;
        } else if ack == old_head {
            // Duplicate, handled above.
            self.cong.pkts_acked(&mut self.tcb, 1, None, now);
        } else {
            let mss = self.tcb.mss;
            let mut segments_acked = current_delivered / mss;
            self.bytes_acked_not_processed += current_delivered % mss;
            if self.bytes_acked_not_processed >= mss {
                segments_acked += 1;
                self.bytes_acked_not_processed -= mss;
            }
            // "If the incoming ACK is a cumulative acknowledgment, the TCP MUST reset DupAcks to zero." rfc6675
            self.dup_ack_count = if self.sack_enabled {
                self.tx_buffer.sacked_packets()
            } else {
                0
            };

            let mut exited_recovery = false;
            match self.tcb.cong_state {
                TcpCongState::Disorder => {
                    segments_acked = segments_acked.saturating_sub(old_dup_ack_count);
                    if !is_dupack {
                        self.cong_state_set(TcpCongState::Open, now);
                    }
                }
                TcpCongState::Recovery => {
                    if ack < self.recover {
                        // Partial ACK, the next hole is lost too.
                        if !self.sack_enabled {
                            self.tx_buffer.mark_head_as_lost();
                            self.update_bytes_in_flight();
                        }
                        if !self.cong.has_cong_control() {
                            self.prr.do_recovery(&mut self.tcb, current_delivered);
                        }
                    } else {
                        self.exit_recovery(now);
                        exited_recovery = true;
                    }
                }
                TcpCongState::Loss => {
                    if ack >= self.recover {
                        self.cong_state_set(TcpCongState::Open, now);
                        self.dup_ack_count = 0;
                    }
                }
                TcpCongState::Open | TcpCongState::Cwr => {}
            }
            if ack >= self.recover {
                self.recover_active = false;
            }

            self.cong
                .pkts_acked(&mut self.tcb, segments_acked, rtt_sample, now);
            if matches!(self.tcb.cong_state, TcpCongState::Open | TcpCongState::Loss)
                && !exited_recovery
                && segments_acked > 0
                && !self.cong.has_cong_control()
            {
                self.cong
                    .increase_window(&mut self.tcb, segments_acked, now);
            }
            self.new_ack(ack, now);
        }

        if let Some(timeout) = self.tx_buffer.take_reorder_timeout() {
            self.timer.set(TcpTimerKind::RackReorder, now + timeout);
        }

        self.update_bytes_in_flight();
        let lost = self.tx_buffer.lost_out().saturating_sub(previous_lost);
        self.rate.generate_sample(
            current_delivered,
            lost,
            false,
            prior_in_flight,
            self.tcb.min_rtt,
        );
        if self.cong.has_cong_control() {
            self.cong.cong_control(
                &mut self.tcb,
                &mut self.rate.conn,
                &self.rate.sample,
                now,
            );
        }
        self.update_pacing_rate();
        log::trace!(
            "{} ACK {} cwnd={} ssthresh={} in_flight={} state={}",
            self.print_log_prefix(),
            ack,
            self.tcb.cwnd,
            self.tcb.ssthresh,
            self.tcb.bytes_in_flight,
            self.tcb.cong_state
        );
    }

    fn discard_acked(&mut self, ack: SequenceNumber32, now: Instant) -> AckedSegments {
        let params = self.rack_params(now);
        let mut acked = AckedSegments::default();
        let rate = &mut self.rate;
        self.tx_buffer.discard_up_to(ack, &params, &mut |segment| {
            // A sacked segment was timed by the ACK that sacked it.
            if segment.sacked && !segment.retrans {
                acked.segments += 1;
            } else {
                acked.delivered(segment);
            }
            rate.skb_delivered(segment, now);
        });
        acked
    }

    /// Takes one RTT sample for this ACK and returns the newest-segment RTT
    /// that congestion control sees.
    ///
    /// The estimator is fed from the oldest clean segment the ACK covers
    /// cumulatively, else from the oldest newly sacked one, else from the
    /// timestamp echo when new data was acked. Karn's algorithm: retransmitted
    /// segments never give a sample, and once one is cumulatively acked the
    /// cumulative part is ambiguous as a whole.
    fn ack_update_rtt(
        &mut self,
        packet: &TcpPacket,
        acked: &AckedSegments,
        sacked: &AckedSegments,
        now: Instant,
    ) -> Option<Duration> {
        let since = |sent: Instant| now.saturating_duration_since(sent);
        let (first, last) = if acked.retransmitted {
            (None, None)
        } else {
            (acked.first_sent, acked.last_sent)
        };
        let seq_rtt = first.or(sacked.first_sent).map(since);
        let ca_rtt = sacked.last_sent.or(last).map(since);
        let (m, ca) = match seq_rtt {
            Some(m) => (m, ca_rtt.unwrap_or(m)),
            None if acked.segments > 0 => {
                let m = self.timestamp_rtt(packet, now)?;
                (m, m)
            }
            None => return None,
        };
        self.rtt_sample(m, ca);
        self.tcb.last_rtt
    }

    fn timestamp_rtt(&self, packet: &TcpPacket, now: Instant) -> Option<Duration> {
        if !self.timestamp_enabled {
            return None;
        }
        let ts = packet.option.timestamps?;
        if ts.ts_echo_reply == 0 {
            return None;
        }
        let elapsed = self.timestamp_now(now).wrapping_sub(ts.ts_echo_reply);
        Some(Duration::from_millis(elapsed as u64))
    }

    /// `m` feeds the estimator, `ca` is the newest segment's RTT for
    /// congestion control and min_rtt.
    fn rtt_sample(&mut self, m: Duration, ca: Duration) {
        let m = m.max(Duration::from_micros(1));
        let ca = ca.max(Duration::from_micros(1));
        self.rtt.update(m);
        self.rtt.reset_rto();
        self.tcb.srtt = self.rtt.srtt();
        self.tcb.last_rtt = Some(ca);
        self.tcb.min_rtt = Some(self.tcb.min_rtt.map_or(ca, |min| min.min(ca)));
        log::trace!(
            "{} RTT sample {:?}, srtt={:?} rto={:?}",
            self.print_log_prefix(),
            m,
            self.rtt.srtt(),
            self.rtt.rto()
        );
    }

    fn dup_ack(&mut self, current_delivered: u32, now: Instant) {
        self.dup_ack_count += 1;
        if self.tcb.cong_state == TcpCongState::Open {
            self.cong_state_set(TcpCongState::Disorder, now);
        }
        match self.tcb.cong_state {
            TcpCongState::Recovery => {
                if !self.sack_enabled {
                    self.tx_buffer.add_reno_sack();
                }
                if !self.cong.has_cong_control() {
                    self.update_bytes_in_flight();
                    self.prr.do_recovery(&mut self.tcb, current_delivered);
                }
            }
            TcpCongState::Disorder => {
                // "(1) DupAcks >= DupThresh ... (2) IsLost (HighACK + 1)" rfc6675 5.0,
                // and no new recovery before the previous one is over.
                let threshold = self.dup_ack_count >= self.config.rec_threshold
                    && (!self.recover_active || self.high_rx_ack_mark >= self.recover);
                if threshold || self.tx_buffer.lost_out() > 0 {
                    self.enter_recovery(current_delivered, now);
                } else if !self.sack_enabled && self.config.limited_transmit {
                    // rfc3042
                    self.tx_buffer.add_reno_sack();
                }
            }
            _ => {}
        }
    }

    pub(crate) fn enter_recovery(&mut self, current_delivered: u32, now: Instant) {
        // "(4.1) RecoveryPoint = HighData" rfc6675
        self.recover = self.tcb.high_tx_mark;
        self.recover_active = true;
        self.cong_state_set(TcpCongState::Recovery, now);
        self.update_bytes_in_flight();
        let in_flight = if self.sack_enabled {
            self.tcb.bytes_in_flight
        } else {
            // The duplicate ACKs left the network too.
            self.tcb.bytes_in_flight + self.tcb.mss
        };
        self.tcb.ssthresh = self.cong.ssthresh(&self.tcb, in_flight);

        // Triggered by the duplicate threshold rather than RACK: the head goes first.
        if !self.sack_enabled || self.tx_buffer.lost_out() == 0 {
            let retransmittable = self
                .tx_buffer
                .head_segment()
                .is_some_and(|head| !head.lost && !head.retrans);
            if retransmittable {
                self.tx_buffer.mark_head_as_lost();
            }
        }
        self.update_bytes_in_flight();
        if !self.cong.has_cong_control() {
            self.prr.enter_recovery(&mut self.tcb, current_delivered);
        }
        log::debug!(
            "{} Enter recovery, recover={} ssthresh={} cwnd={} in_flight={}",
            self.print_log_prefix(),
            self.recover,
            self.tcb.ssthresh,
            self.tcb.cwnd,
            self.tcb.bytes_in_flight
        );
    }

    fn exit_recovery(&mut self, now: Instant) {
        if !self.cong.has_cong_control() {
            self.prr.exit_recovery(&mut self.tcb);
        }
        self.cong_state_set(TcpCongState::Open, now);
        self.dup_ack_count = 0;
        log::debug!(
            "{} Exit recovery, cwnd={}",
            self.print_log_prefix(),
            self.tcb.cwnd
        );
    }

    /// rfc3168 window reduction after an ECN echo.
    pub(crate) fn enter_cwr(&mut self, current_delivered: u32, now: Instant) {
        self.update_bytes_in_flight();
        self.tcb.ssthresh = self.cong.ssthresh(&self.tcb, self.tcb.bytes_in_flight);
        if !self.cong.has_cong_control() {
            self.prr.enter_recovery(&mut self.tcb, current_delivered);
        }
        self.recover = self.tcb.high_tx_mark;
        self.cong_state_set(TcpCongState::Cwr, now);
        log::debug!(
            "{} Enter CWR, ssthresh={} cwnd={}",
            self.print_log_prefix(),
            self.tcb.ssthresh,
            self.tcb.cwnd
        );
    }

    fn new_ack(&mut self, ack: SequenceNumber32, now: Instant) {
        self.data_retr_count = self.config.data_retries;
        if self.status != TcpStatus::SynRcvd {
            self.cancel_retransmission();
            self.rtt.reset_rto();
            let outstanding = ack < self.tcb.high_tx_mark;
            let fin_outstanding = matches!(self.status, TcpStatus::FinWait1 | TcpStatus::Closing)
                && ack <= self.tcb.high_tx_mark;
            if (outstanding || fin_outstanding)
                && !self.timer.is_running(TcpTimerKind::Persist)
            {
                self.timer
                    .set(TcpTimerKind::Retransmission, now + self.rtt.rto());
            }
        }
        let available = self.tx_buffer.available();
        if available > 0 && !self.shutdown_send {
            self.notify(TcpEventType::SendBufferSpace(available));
        }
        if ack > self.tcb.next_tx_seq {
            self.tcb.next_tx_seq = ack;
        }
    }

    fn process_option_sack(
        &mut self,
        packet: &TcpPacket,
        sacked: &mut AckedSegments,
        now: Instant,
    ) -> u32 {
        if !self.sack_enabled {
            return 0;
        }
        let Some(blocks) = &packet.option.sack else {
            return 0;
        };
        let head = self.tx_buffer.head_sequence();
        let high = self.tcb.high_tx_mark;
        // D-SACK and bogus blocks are outside what is outstanding.
        let valid: Vec<SackBlock> = blocks
            .iter()
            .copied()
            .filter(|&(start, end)| start < end && start >= head && end <= high)
            .collect();
        let params = self.rack_params(now);
        let rate = &mut self.rate;
        self.tx_buffer.update(&valid, &params, &mut |segment| {
            sacked.delivered(segment);
            rate.skb_delivered(segment, now);
        })
    }

    fn process_option_timestamp(&mut self, ts: &TcpOptionTimestamp, seq: SequenceNumber32) {
        // "If SEG.TSval >= TS.Recent and SEG.SEQ =< Last.ACK.sent then SEG.TSval is copied to TS.Recent" rfc7323
        if seq == self.rx_buffer.next_rx_sequence() && seq <= self.high_tx_ack {
            self.ts_to_echo = ts.ts_value;
        }
    }

    /// Millisecond clock of the timestamp option, never 0.
    pub(crate) fn timestamp_now(&self, now: Instant) -> u32 {
        (now.saturating_duration_since(self.epoch).as_millis() as u32).wrapping_add(1)
    }

    pub(crate) fn process_syn_options(&mut self, packet: &TcpPacket) {
        // "The window field in a segment where the SYN bit is set MUST NOT be scaled" rfc7323
        self.rwnd = packet.window_size as u32;
        self.ecn_ce_seq = packet.seq_number;
        self.high_rx_mark = packet.seq_number;
        match packet.option.window_scale {
            Some(shift) if self.win_scaling_enabled => {
                self.snd_wind_shift = shift.min(TCP_MAX_WINDOW_SHIFT);
            }
            _ => {
                self.win_scaling_enabled = false;
                self.snd_wind_shift = 0;
                self.rcv_wind_shift = 0;
            }
        }
        if !(packet.option.sack_permitted && self.sack_enabled) {
            self.sack_enabled = false;
            self.tx_buffer.set_sack_enabled(false);
        }
        match packet.option.timestamps {
            Some(ts) if self.timestamp_enabled => self.ts_to_echo = ts.ts_value,
            _ => self.timestamp_enabled = false,
        }
        if let Some(mss) = packet.option.mss {
            self.tcb.mss = self.config.segment_size.min(mss as u32);
        }
        self.tcb.cwnd = self.tcb.initial_cwnd * self.tcb.mss;
        self.tcb.ssthresh = self.config.initial_ssthresh;
        if packet.flag.contains(TcpFlag::ACK) {
            self.high_rx_ack_mark = packet.ack_number;
        }
        log::debug!(
            "{} Peer options: mss={} wscale={:?} sack={} ts={}",
            self.print_log_prefix(),
            self.tcb.mss,
            self.win_scaling_enabled.then_some(self.snd_wind_shift),
            self.sack_enabled,
            self.timestamp_enabled
        );
    }

    // 3.10.7.4 "If SND.UNA =< SEG.ACK =< SND.NXT, the send window should be updated." rfc9293
    fn update_window_size(&mut self, packet: &TcpPacket) {
        let received = (packet.window_size as u32) << self.snd_wind_shift;
        let ack = packet.ack_number;
        let seq = packet.seq_number;
        let update = self.status < TcpStatus::Established
            || (ack == self.high_rx_ack_mark && received > self.rwnd)
            || ack > self.high_rx_ack_mark
            || seq > self.high_rx_mark;
        if update {
            if self.high_rx_ack_mark < ack {
                self.high_rx_ack_mark = ack;
            }
            if self.high_rx_mark < seq {
                self.high_rx_mark = seq;
            }
            if self.rwnd != received {
                log::trace!(
                    "{} Peer window {} -> {}",
                    self.print_log_prefix(),
                    self.rwnd,
                    received
                );
            }
            self.rwnd = received;
        }
    }

    /// SND.NXT as seen by an incoming ACK: the highest data sent, plus our FIN once it went out.
    pub(crate) fn max_acceptable_ack(&self) -> SequenceNumber32 {
        match self.status {
            TcpStatus::FinWait1
            | TcpStatus::FinWait2
            | TcpStatus::Closing
            | TcpStatus::LastAck
            | TcpStatus::TimeWait => self.tcb.high_tx_mark + 1,
            _ => self.tcb.high_tx_mark,
        }
    }

    /// rfc9293 3.10.7.4 acceptability test on the data part of a segment.
    pub(crate) fn out_of_range(&self, head: SequenceNumber32, tail: SequenceNumber32) -> bool {
        match self.status {
            // Receive sequence space is not initialized yet.
            TcpStatus::Listen | TcpStatus::SynSent | TcpStatus::SynRcvd => false,
            // Only the FIN (or its ACK) is expected.
            TcpStatus::LastAck | TcpStatus::Closing | TcpStatus::CloseWait => {
                head != self.rx_buffer.next_rx_sequence()
            }
            _ => {
                tail < self.rx_buffer.next_rx_sequence()
                    || self.rx_buffer.max_rx_sequence() <= head
            }
        }
    }

    pub(crate) fn close_and_notify(&mut self) {
        if !self.close_notified {
            self.notify(TcpEventType::Closed);
            self.close_notified = true;
        }
        log::debug!("{} -> CLOSED", self.print_log_prefix());
        self.deallocate_endpoint();
    }

    /// Stops all timers and detaches from the endpoint.
    pub(crate) fn deallocate_endpoint(&mut self) {
        if self.released {
            return;
        }
        self.timer.stop_all();
        self.retx_flags = None;
        self.status = TcpStatus::Closed;
        self.released = true;
    }
}
