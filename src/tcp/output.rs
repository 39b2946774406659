use crate::fq::FqItem;
use crate::tcp::{
    defs::{EcnState, TcpCaEvent, TcpCongState, TcpError, TcpStatus},
    input::{TcpConnection, TcpEventType},
    packet::{
        TcpFlag, TcpOptionTimestamp, TcpPacket, TCP_HEADER_LENGTH_BASIC, TCP_MAX_WINDOW_SHIFT,
        TCP_OPTION_LENGTH_MAX, TCP_SACK_MAX_BLOCKS,
    },
    seq::SequenceNumber32,
    timer::TcpTimerKind,
};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

pub const IPV4_HEADER_LENGTH: usize = 20;
// Floor of the small queue limit, two full sized packets.
const TCP_TSQ_MIN_BYTES: u32 = 2 * 1500;
// Without pacing the small queue limit is not tied to a rate.
const TCP_TSQ_MAX_BYTES: u32 = 1 << 20;

/// ECN field of the IP header, rfc3168.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EcnCodepoint {
    #[default]
    NotEct,
    Ect,
    Ce,
}

/// A segment on its way to the qdisc, with the addressing the IP layer needs.
#[derive(Debug, Clone, PartialEq)]
pub struct OutSegment {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub packet: TcpPacket,
    pub ecn: EcnCodepoint,
    /// Earliest departure time, set for paced segments.
    pub tx_time: Option<Instant>,
    pub socket_id: Option<usize>,
}

impl OutSegment {
    pub fn new(src: SocketAddrV4, dst: SocketAddrV4, packet: TcpPacket) -> Self {
        Self {
            src,
            dst,
            packet,
            ecn: EcnCodepoint::NotEct,
            tx_time: None,
            socket_id: None,
        }
    }

    /// Bytes on the wire including the IPv4 header.
    pub fn wire_size(&self) -> u32 {
        (IPV4_HEADER_LENGTH
            + TCP_HEADER_LENGTH_BASIC
            + self.packet.option.encoded_len()
            + self.packet.payload.len()) as u32
    }
}

impl FqItem for OutSegment {
    fn size(&self) -> u32 {
        self.wire_size()
    }

    fn tx_time(&self) -> Option<Instant> {
        self.tx_time
    }

    fn set_tx_time(&mut self, at: Instant) {
        self.tx_time = Some(at);
    }

    fn flow_key(&self) -> Option<u64> {
        self.socket_id.map(|id| id as u64)
    }

    fn flow_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        (self.src, self.dst).hash(&mut hasher);
        hasher.finish()
    }

    fn mark_ce(&mut self) -> bool {
        if self.ecn == EcnCodepoint::NotEct {
            return false;
        }
        self.ecn = EcnCodepoint::Ce;
        true
    }
}

impl TcpConnection {
    pub(crate) fn syn_flags(&self) -> TcpFlag {
        // "an ECN-setup SYN packet ... with the ECE and CWR flags set" rfc3168 6.1.1
        if self.config.ecn {
            TcpFlag::SYN | TcpFlag::ECE | TcpFlag::CWR
        } else {
            TcpFlag::SYN
        }
    }

    // Smallest shift that fits the receive buffer into 16 bits.
    pub(crate) fn calculate_wscale(&self) -> u8 {
        let mut max_space = self.rx_buffer.max_buffer_size();
        let mut scale = 0;
        while max_space > u16::MAX as u32 && scale < TCP_MAX_WINDOW_SHIFT {
            max_space >>= 1;
            scale += 1;
        }
        scale
    }

    /// Receive window for the header, `scale` is false on SYN segments.
    pub(crate) fn advertised_window_size(&mut self, scale: bool) -> u16 {
        let window = if self.rx_buffer.got_fin() {
            self.adv_wnd
        } else {
            self.rx_buffer
                .next_rx_sequence()
                .distance_to(self.rx_buffer.max_rx_sequence())
        };
        self.adv_wnd = window;
        let window = if scale {
            window >> self.rcv_wind_shift
        } else {
            window
        };
        window.min(u16::MAX as u32) as u16
    }

    /// min(rwnd, cwnd) less what is in flight.
    pub(crate) fn available_window(&self) -> u32 {
        let window = self.rwnd.min(self.tcb.cwnd);
        window.saturating_sub(self.bytes_in_flight())
    }

    fn create_segment(&mut self, flags: TcpFlag, seq: SequenceNumber32, now: Instant) -> TcpPacket {
        let mut packet = TcpPacket::new();
        packet.src_port = self.local.port();
        packet.dst_port = self.remote.port();
        packet.seq_number = seq;
        packet.ack_number = self.rx_buffer.next_rx_sequence();
        packet.flag = flags;
        packet.window_size = self.advertised_window_size(true);
        if self.timestamp_enabled {
            packet.option.timestamps = Some(TcpOptionTimestamp {
                ts_value: self.timestamp_now(now),
                ts_echo_reply: self.ts_to_echo,
            });
        }
        packet
    }

    // Fills the option space left by timestamps with the most recent blocks.
    fn add_option_sack(&self, packet: &mut TcpPacket) {
        if !self.sack_enabled || self.rx_buffer.sack_list().is_empty() {
            return;
        }
        let room = (TCP_OPTION_LENGTH_MAX - packet.option.encoded_len() - 2) / 8;
        let blocks = self
            .rx_buffer
            .sack_list()
            .iter()
            .take(room.min(TCP_SACK_MAX_BLOCKS))
            .copied()
            .collect();
        packet.option.sack = Some(blocks);
    }

    fn enqueue_segment(&mut self, packet: TcpPacket, ect: bool, tx_time: Option<Instant>) {
        log::trace!(
            "{} Send {}",
            self.print_log_prefix(),
            packet.print_general_info()
        );
        let mut segment = OutSegment::new(self.local, self.remote, packet);
        segment.ecn = if ect {
            EcnCodepoint::Ect
        } else {
            EcnCodepoint::NotEct
        };
        segment.tx_time = tx_time;
        segment.socket_id = Some(self.socket_id);
        if !segment.packet.payload.is_empty() {
            self.bytes_in_qdisc += segment.wire_size();
        }
        self.transmit.push_back(segment);
    }

    /// Sends a segment without data. SYN and FIN arm the retransmission timer.
    pub(crate) fn send_empty_packet(&mut self, flags: TcpFlag, now: Instant) {
        if self.released {
            log::warn!(
                "{} No endpoint, {:?} not sent.",
                self.print_log_prefix(),
                flags
            );
            return;
        }
        let mut flags = flags;
        let mut seq = self.tcb.next_tx_seq;
        if flags.contains(TcpFlag::FIN) {
            flags |= TcpFlag::ACK;
        } else if matches!(
            self.status,
            TcpStatus::FinWait1 | TcpStatus::LastAck | TcpStatus::Closing
        ) {
            // Past our FIN.
            seq += 1;
        }

        let mut packet = self.create_segment(flags, seq, now);
        let mut rto = self.rtt.rto();
        let has_syn = flags.contains(TcpFlag::SYN);
        let has_fin = flags.contains(TcpFlag::FIN);
        if has_syn {
            if self.syn_count == 0 {
                log::warn!(
                    "{} Connection failed, no answer to {} SYN(s).",
                    self.print_log_prefix(),
                    self.config.syn_retries
                );
                self.rtt.reset();
                self.notify(TcpEventType::ConnectionFailed);
                self.close_notified = true;
                self.deallocate_endpoint();
                return;
            }
            if self.win_scaling_enabled {
                self.rcv_wind_shift = self.calculate_wscale();
                packet.option.window_scale = Some(self.rcv_wind_shift);
            }
            if self.sack_enabled {
                packet.option.sack_permitted = true;
            }
            packet.option.mss = Some(self.config.segment_size.min(u16::MAX as u32) as u16);
            // "The window field in a segment where the SYN bit is set MUST NOT be scaled" rfc7323
            packet.window_size = self.advertised_window_size(false);

            let backoff = (self.config.syn_retries - self.syn_count).min(16);
            rto = self.config.connection_timeout * (1 << backoff);
            // Only the first SYN gives an RTT sample.
            self.syn_sent_time = if self.syn_count == self.config.syn_retries {
                Some(now)
            } else {
                None
            };
            self.syn_count -= 1;
        }
        if flags.contains(TcpFlag::ACK) {
            self.timer.stop(TcpTimerKind::DelayedAck);
            self.del_ack_count = 0;
            if self.high_tx_ack < packet.ack_number {
                self.high_tx_ack = packet.ack_number;
            }
            self.add_option_sack(&mut packet);
        }
        self.enqueue_segment(packet, false, None);

        let is_pure_ack = flags == TcpFlag::ACK;
        if (has_syn || has_fin)
            && !is_pure_ack
            && self.status != TcpStatus::LastAck
            && !self.timer.is_running(TcpTimerKind::Retransmission)
        {
            log::trace!(
                "{} Retransmission of {:?} in {:?}.",
                self.print_log_prefix(),
                flags,
                rto
            );
            self.retx_flags = Some(flags);
            self.timer.set(TcpTimerKind::Retransmission, now + rto);
        }
    }

    /// Sends RST and drops the connection.
    pub(crate) fn send_rst(&mut self, now: Instant) {
        log::debug!("{} Abort with RST.", self.print_log_prefix());
        self.send_empty_packet(TcpFlag::RST, now);
        let error = TcpError::ConnectionReset {
            id: self.socket_id,
            addr: self.remote,
        };
        self.notify(TcpEventType::Error(error));
        self.close_notified = true;
        self.deallocate_endpoint();
    }

    pub(crate) fn enter_last_ack(&mut self, now: Instant) {
        log::debug!("{} CLOSE-WAIT -> LAST-ACK", self.print_log_prefix());
        self.status = TcpStatus::LastAck;
        self.data_retr_count = self.config.data_retries;
        self.timer
            .set(TcpTimerKind::LastAck, now + self.rtt.rto());
    }

    /// Starts the close handshake from the current state.
    pub(crate) fn do_close(&mut self, now: Instant) {
        match self.status {
            TcpStatus::SynRcvd | TcpStatus::Established => {
                self.send_empty_packet(TcpFlag::FIN, now);
                log::debug!("{} -> FIN-WAIT-1", self.print_log_prefix());
                self.status = TcpStatus::FinWait1;
            }
            TcpStatus::CloseWait => {
                // LAST-ACK retransmits the FIN on its own timer.
                self.enter_last_ack(now);
                self.send_empty_packet(TcpFlag::FIN | TcpFlag::ACK, now);
            }
            TcpStatus::SynSent | TcpStatus::Closing => self.send_rst(now),
            TcpStatus::Listen => self.close_and_notify(),
            TcpStatus::LastAck
            | TcpStatus::Closed
            | TcpStatus::FinWait1
            | TcpStatus::FinWait2
            | TcpStatus::TimeWait => {}
        }
    }

    /// Pacing applies once enabled and, unless configured otherwise, after the initial window.
    pub(crate) fn is_pacing_enabled(&mut self) -> bool {
        if !self.tcb.pacing {
            return false;
        }
        if !self.pace_initial_window {
            let sent = (self.iss + 1).distance_to(self.tcb.high_tx_mark);
            if sent <= self.tcb.initial_cwnd * self.tcb.mss {
                return false;
            }
            self.pace_initial_window = true;
        }
        true
    }

    /// Rate from cwnd/srtt, faster in slow start. Controllers with their own
    /// `cong_control` set the rate themselves.
    pub(crate) fn update_pacing_rate(&mut self) {
        if self.cong.has_cong_control() || !self.tcb.pacing {
            return;
        }
        let srtt = self.rtt.srtt();
        if srtt.is_zero() {
            return;
        }
        let ratio = if self.tcb.cwnd < self.tcb.ssthresh / 2 {
            self.config.pacing_ss_ratio
        } else {
            self.config.pacing_ca_ratio
        };
        let base = self
            .tcb
            .cwnd
            .max(self.tcb.bytes_in_flight)
            .max(self.tcb.mss) as u128;
        let rate = base * ratio as u128 * 1_000_000_000 / 100 / srtt.as_nanos();
        self.tcb.pacing_rate = (rate.min(u64::MAX as u128) as u64).min(self.tcb.max_pacing_rate);
    }

    // Linux tcp_small_queue_check: at most ~1ms of data sits below the socket.
    fn tsq_throttled(&self) -> bool {
        if !self.config.tsq {
            return false;
        }
        let mut limit = ((self.tcb.pacing_rate / 1000).min(u32::MAX as u64) as u32)
            .max(TCP_TSQ_MIN_BYTES);
        if !self.tcb.pacing {
            limit = limit.min(TCP_TSQ_MAX_BYTES);
        }
        self.bytes_in_qdisc > limit
    }

    /// A segment this connection queued left the qdisc.
    pub fn on_segment_departed(&mut self, segment: &OutSegment, now: Instant) {
        if segment.packet.payload.is_empty() {
            return;
        }
        self.bytes_in_qdisc = self.bytes_in_qdisc.saturating_sub(segment.wire_size());
        if !self.released {
            self.send_pending_data(self.connected, now);
        }
    }

    /// The qdisc refused a segment; treated as congestion.
    pub fn on_segment_dropped(&mut self, segment: &OutSegment, now: Instant) {
        if !segment.packet.payload.is_empty() {
            self.bytes_in_qdisc = self.bytes_in_qdisc.saturating_sub(segment.wire_size());
        }
        if !self.released && self.connected && self.tcb.cong_state < TcpCongState::Cwr {
            log::debug!("{} Local drop, reducing cwnd.", self.print_log_prefix());
            self.enter_cwr(0, now);
        }
    }

    /// rfc6675 (C): sends as much as the windows, Nagle, pacing and TSQ allow.
    /// Returns the number of segments sent.
    pub(crate) fn send_pending_data(&mut self, with_ack: bool, now: Instant) -> u32 {
        if self.tx_buffer.size() == 0 || self.released {
            return 0;
        }
        let mut packets_sent = 0;
        let mut available_window = self.available_window();
        if available_window > 0 {
            let in_flight = self.bytes_in_flight();
            self.rate.calculate_app_limited(
                self.tcb.cwnd,
                in_flight,
                self.tcb.mss,
                self.tx_buffer.tail_sequence(),
                self.tcb.next_tx_seq,
                self.tx_buffer.lost_out(),
                self.tx_buffer.retrans_out(),
            );
        }
        while available_window > 0 {
            if self.is_pacing_enabled() && self.timer.is_running(TcpTimerKind::Pacing) {
                log::trace!("{} Waiting for the pacing timer.", self.print_log_prefix());
                break;
            }
            if self.tcb.cong_state == TcpCongState::Open && self.status == TcpStatus::FinWait1 {
                // FIN already out with the last byte.
                break;
            }
            if self.tsq_throttled() {
                log::trace!(
                    "{} Throttled, {} bytes queued below.",
                    self.print_log_prefix(),
                    self.bytes_in_qdisc
                );
                break;
            }
            // (C.1)
            let is_recovery = self.sack_enabled && self.tcb.cong_state == TcpCongState::Recovery;
            let Some((next, next_high)) =
                self.tx_buffer
                    .next_seg(self.tcb.mss, self.rwnd, is_recovery)
            else {
                break;
            };
            let available_data = self.tx_buffer.size_from_sequence(next);
            // Silly window avoidance, rfc9293 3.8.6.2.1
            if available_window < self.tcb.mss && available_data > available_window {
                log::trace!(
                    "{} Window {} below mss, waiting.",
                    self.print_log_prefix(),
                    available_window
                );
                break;
            }
            // rfc896
            if self.config.nagle
                && self.tx_buffer.head_sequence() < self.tcb.high_tx_mark
                && available_data < self.tcb.mss
            {
                log::trace!("{} Nagle, waiting for ACK.", self.print_log_prefix());
                break;
            }
            let size = available_window
                .min(self.tcb.mss)
                .min(next.distance_to(next_high));
            self.tcb.next_tx_seq = next;
            if self.bytes_in_flight() == 0 {
                self.cwnd_event(TcpCaEvent::TxStart, now);
            }
            let sent = self.send_data_packet(next, size, with_ack, now);
            if sent == 0 || self.released {
                break;
            }
            self.tcb.next_tx_seq = next + sent;
            packets_sent += 1;
            // (C.4) pipe grows with what was sent, (C.5) loop while a window is left.
            available_window = self.available_window();
        }

        self.update_bytes_in_flight();
        let cwnd_limited = self.tcb.bytes_in_flight + self.tcb.mss > self.tcb.cwnd;
        if (packets_sent > 0 || cwnd_limited)
            && (self.tcb.last_acked_seq >= self.cwnd_usage_seq || cwnd_limited)
        {
            self.tcb.is_cwnd_limited = cwnd_limited;
            self.cwnd_usage_seq = self.tcb.high_tx_mark;
        }
        if packets_sent > 0 {
            log::trace!(
                "{} Sent {} segment(s), cwnd={} in_flight={}",
                self.print_log_prefix(),
                packets_sent,
                self.tcb.cwnd,
                self.tcb.bytes_in_flight
            );
        }
        packets_sent
    }

    /// Sends up to `max_size` bytes from `seq`, returns the bytes sent.
    pub(crate) fn send_data_packet(
        &mut self,
        seq: SequenceNumber32,
        max_size: u32,
        with_ack: bool,
        now: Instant,
    ) -> u32 {
        let start_of_transmission = self.bytes_in_flight() == 0;
        let Some(id) = self.tx_buffer.copy_from_sequence(max_size, seq, now) else {
            return 0;
        };
        self.rate
            .skb_sent(self.tx_buffer.segment_mut(id), start_of_transmission, now);
        let segment = self.tx_buffer.segment(id);
        let is_retransmission = segment.retrans;
        let payload = segment.payload.clone();
        let size = payload.len() as u32;
        let remaining = self.tx_buffer.size_from_sequence(seq + size);

        let mut tx_time = None;
        if self.is_pacing_enabled() {
            let rate = self.tcb.pacing_rate.max(1);
            let gap = Duration::from_nanos((size as u128 * 1_000_000_000 / rate as u128) as u64);
            self.tcb.tx_timestamp = Some(now + gap);
            self.timer.set(TcpTimerKind::Pacing, now + gap);
            tx_time = Some(now);
        }

        let mut flags = if with_ack {
            TcpFlag::ACK
        } else {
            TcpFlag::empty()
        };
        if self.tcb.ecn_state == EcnState::EceRcvd
            && self.ecn_echo_seq > self.ecn_cwr_seq
            && !is_retransmission
        {
            log::debug!("{} EceRcvd -> CwrSent", self.print_log_prefix());
            self.tcb.ecn_state = EcnState::CwrSent;
            self.ecn_cwr_seq = seq;
            flags |= TcpFlag::CWR;
        }
        if self.close_on_empty && remaining == 0 {
            flags |= TcpFlag::FIN;
            match self.status {
                TcpStatus::Established => {
                    log::debug!("{} -> FIN-WAIT-1", self.print_log_prefix());
                    self.status = TcpStatus::FinWait1;
                }
                TcpStatus::CloseWait => self.enter_last_ack(now),
                _ => {}
            }
        }

        let mut packet = self.create_segment(flags, seq, now);
        packet.payload = payload;
        if with_ack {
            self.timer.stop(TcpTimerKind::DelayedAck);
            self.del_ack_count = 0;
            if self.high_tx_ack < packet.ack_number {
                self.high_tx_ack = packet.ack_number;
            }
            self.add_option_sack(&mut packet);
        }
        let ect = self.tcb.ecn_state != EcnState::Disabled;
        self.enqueue_segment(packet, ect, tx_time);

        // Retransmitting the head restarts the timer from now.
        if is_retransmission && seq == self.tx_buffer.head_sequence() {
            self.cancel_retransmission();
        }
        if !self.timer.is_running(TcpTimerKind::Retransmission) {
            self.timer
                .set(TcpTimerKind::Retransmission, now + self.rtt.rto());
        }
        if matches!(self.tcb.cong_state, TcpCongState::Recovery | TcpCongState::Cwr) {
            self.prr.update_bytes_sent(size);
        }
        self.tcb.high_tx_mark = self.tcb.high_tx_mark.max(seq + size);
        size
    }

    /// One byte past the window, rfc9293 3.8.6.1.
    pub(crate) fn send_window_probe(&mut self, now: Instant) {
        let seq = self.tcb.next_tx_seq;
        let payload = self.tx_buffer.peek(seq, 1);
        if payload.is_empty() {
            log::trace!("{} Nothing to probe with.", self.print_log_prefix());
            return;
        }
        log::debug!(
            "{} Zero window probe at {}, next in {:?}.",
            self.print_log_prefix(),
            seq,
            self.persist_timeout
        );
        let mut packet = self.create_segment(TcpFlag::ACK, seq, now);
        packet.payload = payload;
        if self.high_tx_ack < packet.ack_number {
            self.high_tx_ack = packet.ack_number;
        }
        let ect = self.tcb.ecn_state != EcnState::Disabled;
        self.enqueue_segment(packet, ect, None);
    }

    /// Tells the peer about a window that reopened after the application read.
    pub(crate) fn send_window_update(&mut self, previous_window: u32, now: Instant) {
        if !self.connected || self.rx_buffer.got_fin() {
            return;
        }
        let window = self
            .rx_buffer
            .next_rx_sequence()
            .distance_to(self.rx_buffer.max_rx_sequence());
        if previous_window < 2 * self.tcb.mss && window >= 2 * self.tcb.mss {
            log::debug!(
                "{} Window update {} -> {}.",
                self.print_log_prefix(),
                previous_window,
                window
            );
            self.send_empty_packet(TcpFlag::ACK, now);
        }
    }
}

#[cfg(test)]
mod output_tests {
    use super::*;
    use crate::config::{CongestionKind, StackConfig, TcpConfig};
    use crate::tcp::congestion::new_congestion_ops;
    use rstest::rstest;
    use std::net::Ipv4Addr;

    fn connection(config: TcpConfig) -> TcpConnection {
        let stack = StackConfig::default();
        let mut conn = TcpConnection::new(
            7,
            &config,
            new_congestion_ops(CongestionKind::Cubic, &stack),
            Instant::now(),
        );
        conn.local = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 49153);
        conn.remote = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 80);
        conn
    }

    #[rstest]
    #[case(65535, 0)]
    #[case(65536, 1)]
    #[case(131072, 2)]
    #[case(1 << 30, TCP_MAX_WINDOW_SHIFT)]
    fn test_calculate_wscale(#[case] rcv_buf_size: u32, #[case] expected: u8) {
        let conn = connection(TcpConfig {
            rcv_buf_size,
            ..Default::default()
        });
        assert_eq!(conn.calculate_wscale(), expected);
    }

    #[test]
    fn test_syn_carries_options_and_backs_off() {
        let t0 = Instant::now();
        let mut conn = connection(TcpConfig::default());
        conn.initialize_sequence(SequenceNumber32::new(1000));
        conn.status = TcpStatus::SynSent;
        conn.send_empty_packet(conn.syn_flags(), t0);

        let syn = conn.poll_transmit().unwrap();
        assert_eq!(syn.packet.flag, TcpFlag::SYN);
        assert_eq!(syn.packet.seq_number, SequenceNumber32::new(1000));
        assert_eq!(syn.packet.option.mss, Some(536));
        assert_eq!(syn.packet.option.window_scale, Some(2));
        assert!(syn.packet.option.sack_permitted);
        assert!(syn.packet.option.timestamps.is_some());
        // Unscaled and capped.
        assert_eq!(syn.packet.window_size, u16::MAX);
        assert_eq!(conn.syn_sent_time, Some(t0));
        assert_eq!(
            conn.timer.get(TcpTimerKind::Retransmission),
            Some(t0 + Duration::from_secs(3))
        );

        // Second SYN: doubled, and no RTT sample from it.
        let t1 = t0 + Duration::from_secs(3);
        conn.handle_timeout(t1);
        assert!(conn.poll_transmit().is_some());
        assert_eq!(conn.syn_sent_time, None);
        assert_eq!(
            conn.timer.get(TcpTimerKind::Retransmission),
            Some(t1 + Duration::from_secs(6))
        );
    }

    #[test]
    fn test_syn_retries_exhausted() {
        let mut now = Instant::now();
        let mut conn = connection(TcpConfig {
            syn_retries: 2,
            ..Default::default()
        });
        conn.initialize_sequence(SequenceNumber32::new(1));
        conn.status = TcpStatus::SynSent;
        conn.send_empty_packet(conn.syn_flags(), now);
        while let Some(at) = conn.next_timeout() {
            now = at;
            conn.handle_timeout(now);
        }
        let sent = std::iter::from_fn(|| conn.poll_transmit()).count();
        assert_eq!(sent, 2);
        assert_eq!(conn.poll_event(), Some(TcpEventType::ConnectionFailed));
        assert!(conn.released);
        assert_eq!(conn.status, TcpStatus::Closed);
    }

    #[test]
    fn test_sack_blocks_fit_next_to_timestamps() {
        let t0 = Instant::now();
        let mut conn = connection(TcpConfig::default());
        conn.status = TcpStatus::Established;
        conn.connected = true;
        conn.rx_buffer.set_next_rx_sequence(SequenceNumber32::new(0));
        for i in 0..5u32 {
            conn.rx_buffer
                .add(SequenceNumber32::new(100 + i * 200), &[0u8; 100]);
        }
        conn.send_empty_packet(TcpFlag::ACK, t0);
        let ack = conn.poll_transmit().unwrap();
        let blocks = ack.packet.option.sack.clone().unwrap();
        assert_eq!(blocks.len(), 3);
        // Most recent first.
        assert_eq!(
            blocks[0],
            (SequenceNumber32::new(900), SequenceNumber32::new(1000))
        );
        assert!(ack.packet.option.encoded_len() <= TCP_OPTION_LENGTH_MAX);

        conn.timestamp_enabled = false;
        conn.send_empty_packet(TcpFlag::ACK, t0);
        let ack = conn.poll_transmit().unwrap();
        assert_eq!(ack.packet.option.sack.unwrap().len(), TCP_SACK_MAX_BLOCKS);
    }

    #[test]
    fn test_out_segment_as_fq_item() {
        let mut packet = TcpPacket::new();
        packet.payload = vec![0; 100];
        let mut segment = OutSegment::new(
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 1),
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 2),
            packet,
        );
        assert_eq!(segment.size(), 140);
        assert_eq!(segment.flow_key(), None);
        assert!(!segment.mark_ce());
        segment.ecn = EcnCodepoint::Ect;
        assert!(segment.mark_ce());
        assert_eq!(segment.ecn, EcnCodepoint::Ce);
    }

    #[rstest]
    // cwnd below ssthresh/2: slow start ratio, 10 * 536 * 2 / 0.1s
    #[case(5360, u32::MAX, 107_200)]
    // congestion avoidance ratio 1.2
    #[case(5360, 5360, 64_320)]
    fn test_update_pacing_rate(#[case] cwnd: u32, #[case] ssthresh: u32, #[case] expected: u64) {
        let mut conn = connection(TcpConfig {
            pacing: true,
            ..Default::default()
        });
        conn.tcb.cwnd = cwnd;
        conn.tcb.ssthresh = ssthresh;
        conn.rtt.update(Duration::from_millis(100));
        conn.update_pacing_rate();
        assert_eq!(conn.tcb.pacing_rate, expected);
    }
}
