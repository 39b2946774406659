use crate::config::TcpConfig;
use crate::tcp::{
    defs::{EcnState, TcpCaEvent, TcpCongState, TcpError, TcpStatus},
    input::{TcpConnection, TcpEventType},
    packet::TcpFlag,
};
use std::time::{Duration, Instant};

// "The value for RTO.max is to be at least 60 seconds." rfc6298 2.5
pub const TCP_PERSIST_TIMEOUT_MAX: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcpTimerKind {
    Retransmission = 0,
    DelayedAck = 1,
    Persist = 2,
    LastAck = 3,
    TimeWait = 4,
    Pacing = 5,
    SendPending = 6,
    RackReorder = 7,
}

impl TcpTimerKind {
    pub const VALUES: [Self; 8] = [
        TcpTimerKind::Retransmission,
        TcpTimerKind::DelayedAck,
        TcpTimerKind::Persist,
        TcpTimerKind::LastAck,
        TcpTimerKind::TimeWait,
        TcpTimerKind::Pacing,
        TcpTimerKind::SendPending,
        TcpTimerKind::RackReorder,
    ];
}

/// One deadline per purpose. Setting a running timer replaces its deadline,
/// so a purpose never fires twice.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTimer {
    data: [Option<Instant>; 8],
}

impl TcpTimer {
    pub fn set(&mut self, kind: TcpTimerKind, at: Instant) {
        self.data[kind as usize] = Some(at);
    }

    pub fn get(&self, kind: TcpTimerKind) -> Option<Instant> {
        self.data[kind as usize]
    }

    pub fn stop(&mut self, kind: TcpTimerKind) {
        self.data[kind as usize] = None;
    }

    pub fn stop_all(&mut self) {
        self.data = [None; 8];
    }

    pub fn is_running(&self, kind: TcpTimerKind) -> bool {
        self.data[kind as usize].is_some()
    }

    pub fn next_timeout(&self) -> Option<Instant> {
        self.data.iter().filter_map(|&t| t).min()
    }

    /// Removes and returns the earliest timer due at `now`. Ties go to the
    /// lower kind so retransmission is handled before the others.
    pub fn expire_before(&mut self, now: Instant) -> Option<TcpTimerKind> {
        let mut earliest: Option<(Instant, TcpTimerKind)> = None;
        for kind in TcpTimerKind::VALUES {
            if let Some(at) = self.data[kind as usize] {
                if at <= now && earliest.map_or(true, |(e, _)| at < e) {
                    earliest = Some((at, kind));
                }
            }
        }
        let (_, kind) = earliest?;
        self.stop(kind);
        Some(kind)
    }
}

/// Smoothed RTT and retransmission timeout, rfc6298 with the Linux mdev update.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt: Duration,
    rttvar: Duration,
    rto: Duration,
    min_rto: Duration,
    max_rto: Duration,
    granularity: Duration,
}

impl RttEstimator {
    pub fn new(config: &TcpConfig) -> Self {
        Self {
            srtt: Duration::ZERO,
            rttvar: Duration::ZERO,
            rto: config.initial_rto,
            min_rto: config.min_rto,
            max_rto: config.max_rto,
            granularity: config.clock_granularity,
        }
    }

    /// Zero until the first sample.
    pub fn srtt(&self) -> Duration {
        self.srtt
    }

    pub fn rttvar(&self) -> Duration {
        self.rttvar
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }

    pub fn set_rto(&mut self, rto: Duration) {
        self.rto = rto;
    }

    /// Forgets all samples, e.g. before a connection attempt.
    pub fn reset(&mut self) {
        self.srtt = Duration::ZERO;
        self.rttvar = Duration::ZERO;
    }

    pub fn update(&mut self, m: Duration) {
        if self.srtt.is_zero() {
            // (2.2) SRTT <- R, RTTVAR <- R/2
            self.srtt = m;
            self.rttvar = m / 2;
            return;
        }
        let m_ns = m.as_nanos() as i128;
        let srtt_ns = self.srtt.as_nanos() as i128;
        let var_ns = self.rttvar.as_nanos() as i128;
        let delta = m_ns - srtt_ns;
        let srtt_ns = srtt_ns + delta / 8;
        let d = if delta < 0 {
            // A sample below srtt only moves rttvar by a fraction when it exceeds it.
            let d = -delta - var_ns;
            if d > 0 {
                d / 8
            } else {
                d
            }
        } else {
            delta - var_ns
        };
        let var_ns = (var_ns + d / 4).max(0);
        self.srtt = Duration::from_nanos(srtt_ns.max(0) as u64);
        self.rttvar = Duration::from_nanos(var_ns as u64);
    }

    /// srtt + max(G, 4*rttvar), floored at the minimum RTO.
    pub fn timeout(&self) -> Duration {
        (self.srtt + self.granularity.max(self.rttvar * 4)).max(self.min_rto)
    }

    /// (2.5) recomputation after a sample, bounded by the maximum.
    pub fn reset_rto(&mut self) {
        self.rto = self.timeout().min(self.max_rto);
    }

    /// (5.5) doubles the timer.
    pub fn backoff(&mut self) {
        self.rto = (self.rto * 2).min(self.max_rto);
    }
}

impl TcpConnection {
    pub fn next_timeout(&self) -> Option<Instant> {
        self.timer.next_timeout()
    }

    /// Runs every timer that is due at `now`.
    pub fn handle_timeout(&mut self, now: Instant) {
        while let Some(kind) = self.timer.expire_before(now) {
            if self.released {
                return;
            }
            log::debug!("{} {:?} timer fired.", self.print_log_prefix(), kind);
            match kind {
                TcpTimerKind::Retransmission => self.timer_handler_retransmission(now),
                TcpTimerKind::DelayedAck => self.timer_handler_delayed_ack(now),
                TcpTimerKind::Persist => self.timer_handler_persist(now),
                TcpTimerKind::LastAck => self.timer_handler_last_ack(now),
                TcpTimerKind::TimeWait => self.timer_handler_timewait(now),
                TcpTimerKind::Pacing | TcpTimerKind::SendPending => {
                    self.send_pending_data(self.connected, now);
                }
                TcpTimerKind::RackReorder => self.timer_handler_rack(now),
            }
        }
    }

    fn timer_handler_retransmission(&mut self, now: Instant) {
        // SYN and FIN are re-sent with the flags they went out with.
        if let Some(flags) = self.retx_flags.take() {
            self.send_empty_packet(flags, now);
            return;
        }
        self.retransmission_timeout(now);
    }

    fn retransmission_timeout(&mut self, now: Instant) {
        if matches!(self.status, TcpStatus::Closed | TcpStatus::TimeWait) {
            return;
        }
        if self.status == TcpStatus::SynSent {
            self.send_empty_packet(self.syn_flags(), now);
            return;
        }
        if self.tx_buffer.size() == 0 {
            if matches!(self.status, TcpStatus::FinWait1 | TcpStatus::Closing) {
                // Must have lost FIN, re-send.
                self.send_empty_packet(TcpFlag::FIN, now);
            }
            return;
        }
        if self.data_retr_count == 0 {
            log::warn!(
                "{} Data retransmission retries exhausted.",
                self.print_log_prefix()
            );
            let error = TcpError::TimedOut {
                id: self.socket_id,
                addr: self.remote_addr(),
            };
            self.notify(TcpEventType::Error(error));
            self.deallocate_endpoint();
            return;
        }
        self.data_retr_count -= 1;

        let in_flight_before_rto = self.bytes_in_flight();
        if !self.sack_enabled {
            self.tx_buffer.reset_reno_sack();
        }
        // "If an RTO occurs during loss recovery as specified in this document,
        // RecoveryPoint MUST be set to HighData." rfc6675 5.1
        self.tx_buffer.set_sent_list_lost(!self.sack_enabled);
        self.recover = self.tcb.high_tx_mark;
        self.rtt.backoff();

        // Lower ssthresh only the first time the head goes out on a timeout.
        if self.tcb.cong_state != TcpCongState::Loss || !self.tx_buffer.is_head_retransmitted() {
            let ssthresh = self.cong.ssthresh(&self.tcb, in_flight_before_rto);
            self.tcb.ssthresh = ssthresh.max(2 * self.tcb.mss);
        }
        self.cwnd_event(TcpCaEvent::Loss, now);
        self.cong_state_set(TcpCongState::Loss, now);
        self.tcb.cwnd = self.tcb.mss;
        self.timer.stop(TcpTimerKind::Pacing);
        log::debug!(
            "{} RTO: rto={:?} ssthresh={} cwnd={} in_flight={}",
            self.print_log_prefix(),
            self.rtt.rto(),
            self.tcb.ssthresh,
            self.tcb.cwnd,
            self.bytes_in_flight()
        );
        self.send_pending_data(self.connected, now);
    }

    fn timer_handler_delayed_ack(&mut self, now: Instant) {
        self.del_ack_count = 0;
        self.cwnd_event(TcpCaEvent::DelayedAck, now);
        self.send_ack_with_ece(now);
    }

    fn timer_handler_last_ack(&mut self, now: Instant) {
        if self.status != TcpStatus::LastAck {
            return;
        }
        if self.data_retr_count == 0 {
            let error = TcpError::TimedOut {
                id: self.socket_id,
                addr: self.remote_addr(),
            };
            self.notify(TcpEventType::Error(error));
            self.deallocate_endpoint();
            return;
        }
        self.data_retr_count -= 1;
        self.send_empty_packet(TcpFlag::FIN | TcpFlag::ACK, now);
        self.timer
            .set(TcpTimerKind::LastAck, now + self.rtt.rto());
    }

    // 3.8.6.1 Zero-Window Probing rfc9293
    fn timer_handler_persist(&mut self, now: Instant) {
        self.persist_timeout = (self.persist_timeout * 2).min(TCP_PERSIST_TIMEOUT_MAX);
        self.send_window_probe(now);
        self.timer
            .set(TcpTimerKind::Persist, now + self.persist_timeout);
    }

    fn timer_handler_timewait(&mut self, _now: Instant) {
        log::info!("{} TIME-WAIT expired.", self.print_log_prefix());
        self.close_and_notify();
    }

    fn timer_handler_rack(&mut self, now: Instant) {
        let params = self.rack_params(now);
        if let Some(pending) = self.tx_buffer.update_lost_count(&params) {
            self.timer.set(TcpTimerKind::RackReorder, now + pending);
        }
        if self.tcb.cong_state == TcpCongState::Open && self.tx_buffer.lost_out() > 0 {
            self.enter_recovery(0, now);
        }
        self.send_pending_data(self.connected, now);
    }

    pub(crate) fn send_ack_with_ece(&mut self, now: Instant) {
        if matches!(
            self.tcb.ecn_state,
            EcnState::CeRcvd | EcnState::SendingEce
        ) {
            self.send_empty_packet(TcpFlag::ACK | TcpFlag::ECE, now);
            self.tcb.ecn_state = EcnState::SendingEce;
        } else {
            self.send_empty_packet(TcpFlag::ACK, now);
        }
    }

    /// Enters TIME-WAIT and schedules the final close after 2*MSL.
    pub(crate) fn time_wait(&mut self, now: Instant) {
        log::debug!("{} -> TIME-WAIT", self.print_log_prefix());
        self.status = TcpStatus::TimeWait;
        self.timer.stop_all();
        if !self.close_notified {
            self.notify(TcpEventType::Closed);
            self.close_notified = true;
        }
        self.timer
            .set(TcpTimerKind::TimeWait, now + self.config.msl * 2);
    }
}
