use super::filter::MaxFilter;
use super::{CongestionOps, ControlBlock};
use crate::config::BbrConfig;
use crate::tcp::defs::{TcpCaEvent, TcpCongState};
use crate::tcp::rate::{RateConnection, RateSample};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::{Duration, Instant};

// BBR v1 (draft-cardwell-iccrg-bbr-congestion-control-00), following the
// Linux tcp_bbr.c structure. Bandwidth is in bytes per second.

// Drains the startup queue in about one round.
const DRAIN_GAIN: f64 = 0.3465736;
const CWND_GAIN: f64 = 2.0;
const PACING_GAIN: [f64; GAIN_CYCLE_LENGTH] = [1.25, 0.75, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0];
const GAIN_CYCLE_LENGTH: usize = 8;
// Two outstanding two-segment delayed ACK sequences.
const CWND_MIN_TARGET_PKTS: u32 = 4;
const FULL_BW_THRESH: f64 = 1.25;
const FULL_BW_CNT: u32 = 3;
const EXTRA_ACK_GAIN: u32 = 1;
const LT_INTERVAL_MIN_RTTS: u32 = 4;
const LT_BW_RATIO: f64 = 0.125;
// 4 kbit/s
const LT_BW_DIFF: u64 = 500;
const LT_BW_MAX_RTTS: u32 = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BbrMode {
    Startup,
    Drain,
    ProbeBw,
    ProbeRtt,
}

#[derive(Debug, Clone)]
pub struct Bbr {
    config: BbrConfig,
    rng: StdRng,
    initialized: bool,
    mode: BbrMode,
    full_bw: u64,
    full_bw_cnt: u32,
    cycle_idx: usize,
    pacing_gain: f64,
    cwnd_gain: f64,

    min_rtt: Option<Duration>,
    min_rtt_stamp: Option<Instant>,
    probe_rtt_done_stamp: Option<Instant>,
    bw_filter: MaxFilter,
    rtt_cnt: u64,
    next_rtt_delivered: u64,
    cycle_stamp: Option<Instant>,

    has_seen_rtt: bool,
    full_bw_reached: bool,
    round_start: bool,
    idle_restart: bool,
    probe_rtt_round_done: bool,
    packet_conservation: bool,
    prev_ca_state: TcpCongState,
    prior_cwnd: u32,

    ack_epoch_stamp: Option<Instant>,
    extra_acked: [u32; 2],
    ack_epoch_acked: u32,
    extra_acked_win_rtts: u32,
    extra_acked_win_idx: usize,

    lt_is_sampling: bool,
    lt_use_bw: bool,
    lt_rtt_cnt: u32,
    lt_bw: u64,
    lt_last_delivered: u64,
    lt_last_stamp: Option<Instant>,
    lt_last_lost: u64,
}

impl Bbr {
    pub fn new(config: BbrConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        let bw_filter = MaxFilter::new(config.bw_window_length);
        Self {
            config,
            rng,
            initialized: false,
            mode: BbrMode::Startup,
            full_bw: 0,
            full_bw_cnt: 0,
            cycle_idx: 0,
            pacing_gain: 0.0,
            cwnd_gain: 0.0,
            min_rtt: None,
            min_rtt_stamp: None,
            probe_rtt_done_stamp: None,
            bw_filter,
            rtt_cnt: 0,
            next_rtt_delivered: 0,
            cycle_stamp: None,
            has_seen_rtt: false,
            full_bw_reached: false,
            round_start: false,
            idle_restart: false,
            probe_rtt_round_done: false,
            packet_conservation: false,
            prev_ca_state: TcpCongState::Open,
            prior_cwnd: 0,
            ack_epoch_stamp: None,
            extra_acked: [0, 0],
            ack_epoch_acked: 0,
            extra_acked_win_rtts: 0,
            extra_acked_win_idx: 0,
            lt_is_sampling: false,
            lt_use_bw: false,
            lt_rtt_cnt: 0,
            lt_bw: 0,
            lt_last_delivered: 0,
            lt_last_stamp: None,
            lt_last_lost: 0,
        }
    }

    pub fn mode(&self) -> BbrMode {
        self.mode
    }

    fn bbr_init(&mut self, tcb: &mut ControlBlock, rate: &RateConnection, now: Instant) {
        self.min_rtt = tcb.min_rtt;
        self.min_rtt_stamp = Some(now);
        self.bw_filter = MaxFilter::new(self.config.bw_window_length);
        self.bw_filter.reset(0, 0);
        self.init_pacing_rate_from_rtt(tcb);
        self.reset_lt_bw_sampling(tcb, rate);
        self.ack_epoch_stamp = Some(now);
        tcb.pacing = true;
        self.initialized = true;
    }

    fn bw(&self) -> u64 {
        if self.lt_use_bw {
            self.lt_bw
        } else {
            self.bw_filter.best()
        }
    }

    fn bdp(&self, tcb: &ControlBlock, bw: u64, gain: f64) -> u32 {
        let Some(min_rtt) = self.min_rtt else {
            return tcb.initial_cwnd * tcb.mss;
        };
        let bdp = (bw as f64 * min_rtt.as_secs_f64() * gain) as u32;
        let tmp = bdp + tcb.mss - 1;
        tmp - (tmp % tcb.mss)
    }

    // Room for one segment in the qdisc, one in the offload engine and one
    // held by a delayed ACK on the receiver.
    fn quantization_budget(&self, tcb: &ControlBlock, cwnd: u32) -> u32 {
        let mut cwnd = cwnd + 2 * tcb.mss;
        if self.mode == BbrMode::ProbeBw && self.cycle_idx == 0 {
            cwnd += 2 * tcb.mss;
        }
        cwnd
    }

    fn inflight(&self, tcb: &ControlBlock, bw: u64, gain: f64) -> u32 {
        let bdp = self.bdp(tcb, bw, gain);
        self.quantization_budget(tcb, bdp)
    }

    fn update_model(
        &mut self,
        tcb: &mut ControlBlock,
        rate: &mut RateConnection,
        rs: &RateSample,
        now: Instant,
    ) {
        self.update_bw(tcb, rate, rs);
        self.update_ack_aggregation(tcb, rate, rs);
        self.update_cycle_phase(tcb, rate, rs, now);
        self.check_full_bw_reached(rs);
        self.check_drain(tcb, now);
        self.update_min_rtt(tcb, rate, rs, now);
        self.update_gains();
    }

    fn update_bw(&mut self, tcb: &ControlBlock, rate: &RateConnection, rs: &RateSample) {
        self.round_start = false;
        if !rs.valid {
            return;
        }
        if rs.prior_delivered >= self.next_rtt_delivered {
            self.next_rtt_delivered = rate.delivered;
            self.rtt_cnt += 1;
            self.round_start = true;
            self.packet_conservation = false;
        }
        self.lt_bw_sampling(tcb, rate, rs);
        if !rs.is_app_limited || rs.delivery_rate >= self.bw_filter.best() {
            self.bw_filter.update(rs.delivery_rate, self.rtt_cnt);
        }
    }

    fn update_ack_aggregation(&mut self, tcb: &ControlBlock, rate: &RateConnection, rs: &RateSample) {
        if !self.config.enable_ack_aggregation
            || EXTRA_ACK_GAIN == 0
            || rs.acked_sacked == 0
            || !rs.valid
        {
            return;
        }
        if self.round_start {
            self.extra_acked_win_rtts = (self.extra_acked_win_rtts + 1).min(0x1F);
            if self.extra_acked_win_rtts >= self.config.extra_acked_rtt_window {
                self.extra_acked_win_rtts = 0;
                self.extra_acked_win_idx = 1 - self.extra_acked_win_idx;
                self.extra_acked[self.extra_acked_win_idx] = 0;
            }
        }

        let epoch_time = match (rate.delivered_time, self.ack_epoch_stamp) {
            (Some(delivered), Some(epoch)) => delivered.saturating_duration_since(epoch),
            _ => Duration::ZERO,
        };
        let mut expected_acked = (self.bw() as f64 * epoch_time.as_secs_f64()) as u32;

        // A slow ACK rate or a very old epoch starts a new one.
        let thresh = (tcb.mss as u64 * self.config.ack_epoch_acked_reset_threshold as u64)
            .min(u32::MAX as u64) as u32;
        if self.ack_epoch_acked <= expected_acked
            || self.ack_epoch_acked as u64 + rs.acked_sacked as u64 > thresh as u64
        {
            self.ack_epoch_acked = 0;
            self.ack_epoch_stamp = rate.delivered_time;
            expected_acked = 0;
        }
        self.ack_epoch_acked = (self.ack_epoch_acked + rs.acked_sacked).min(thresh - tcb.mss);
        let extra = self
            .ack_epoch_acked
            .saturating_sub(expected_acked)
            .min(tcb.cwnd);
        if extra > self.extra_acked[self.extra_acked_win_idx] {
            self.extra_acked[self.extra_acked_win_idx] = extra;
        }
    }

    fn update_cycle_phase(
        &mut self,
        tcb: &ControlBlock,
        rate: &RateConnection,
        rs: &RateSample,
        now: Instant,
    ) {
        if self.mode == BbrMode::ProbeBw && self.is_next_cycle_phase(tcb, rate, rs, now) {
            self.advance_cycle_phase(now);
        }
    }

    fn is_next_cycle_phase(
        &self,
        tcb: &ControlBlock,
        rate: &RateConnection,
        rs: &RateSample,
        now: Instant,
    ) -> bool {
        let is_full_length = match (rate.delivered_time, self.cycle_stamp, self.min_rtt) {
            (Some(delivered), Some(cycle), Some(min_rtt)) => {
                delivered.saturating_duration_since(cycle) > min_rtt
            }
            _ => false,
        };
        if self.pacing_gain == 1.0 {
            return is_full_length;
        }
        let inflight = self.bytes_in_net_at_edt(tcb, rs.prior_in_flight, now);
        let bw = self.bw_filter.best();
        // Probing up lasts until inflight reaches gain * BDP, unless packets are lost.
        if self.pacing_gain > 1.0 {
            return is_full_length
                && (rs.bytes_loss != 0 || inflight >= self.inflight(tcb, bw, self.pacing_gain));
        }
        // Draining stops early once the queue is gone.
        is_full_length || inflight <= self.inflight(tcb, bw, 1.0)
    }

    fn bytes_in_net_at_edt(&self, tcb: &ControlBlock, inflight_now: u32, now: Instant) -> u32 {
        let interval = tcb
            .tx_timestamp
            .map_or(Duration::ZERO, |edt| edt.saturating_duration_since(now));
        let interval_delivered = (self.bw() as f64 * interval.as_secs_f64()) as u32;
        let mut inflight_at_edt = inflight_now;
        if self.pacing_gain > 1.0 {
            inflight_at_edt += tcb.mss;
        }
        inflight_at_edt.saturating_sub(interval_delivered)
    }

    fn advance_cycle_phase(&mut self, now: Instant) {
        self.cycle_idx = (self.cycle_idx + 1) % GAIN_CYCLE_LENGTH;
        self.cycle_stamp = Some(now);
    }

    fn check_full_bw_reached(&mut self, rs: &RateSample) {
        if self.full_bw_reached || !self.round_start || rs.is_app_limited {
            return;
        }
        let best = self.bw_filter.best();
        if best as f64 >= self.full_bw as f64 * FULL_BW_THRESH {
            self.full_bw = best;
            self.full_bw_cnt = 0;
            return;
        }
        self.full_bw_cnt += 1;
        self.full_bw_reached = self.full_bw_cnt >= FULL_BW_CNT;
        if self.full_bw_reached {
            log::debug!("BBR pipe full at {} B/s after {} rounds.", self.full_bw, self.rtt_cnt);
        }
    }

    fn check_drain(&mut self, tcb: &mut ControlBlock, now: Instant) {
        if self.mode == BbrMode::Startup && self.full_bw_reached {
            self.mode = BbrMode::Drain;
            tcb.ssthresh = self.inflight(tcb, self.bw_filter.best(), 1.0);
            log::debug!("BBR enters DRAIN, ssthresh={}.", tcb.ssthresh);
        }
        if self.mode == BbrMode::Drain {
            let inflight_at_edt = self.bytes_in_net_at_edt(tcb, tcb.bytes_in_flight, now);
            if inflight_at_edt <= self.inflight(tcb, self.bw_filter.best(), 1.0) {
                self.reset_probe_bw_mode(now);
            }
        }
    }

    fn reset_probe_bw_mode(&mut self, now: Instant) {
        self.mode = BbrMode::ProbeBw;
        // Never start in the 0.75 phase.
        self.cycle_idx = GAIN_CYCLE_LENGTH - 1 - self.rng.gen_range(0..GAIN_CYCLE_LENGTH - 1);
        self.advance_cycle_phase(now);
        log::debug!("BBR enters PROBE_BW at phase {}.", self.cycle_idx);
    }

    fn update_min_rtt(
        &mut self,
        tcb: &mut ControlBlock,
        rate: &mut RateConnection,
        rs: &RateSample,
        now: Instant,
    ) {
        let filter_expired = self
            .min_rtt_stamp
            .is_some_and(|stamp| now > stamp + self.config.rtt_window_length);
        if let Some(rtt) = rs.rtt.filter(|rtt| !rtt.is_zero()) {
            if self.min_rtt.map_or(true, |min_rtt| rtt < min_rtt) || filter_expired {
                self.min_rtt = Some(rtt);
                self.min_rtt_stamp = Some(now);
            }
        }

        if !self.config.probe_rtt_duration.is_zero()
            && filter_expired
            && !self.idle_restart
            && self.mode != BbrMode::ProbeRtt
        {
            self.mode = BbrMode::ProbeRtt;
            self.save_cwnd(tcb);
            self.probe_rtt_done_stamp = None;
            log::debug!("BBR enters PROBE_RTT, min_rtt={:?}.", self.min_rtt);
        }

        if self.mode == BbrMode::ProbeRtt {
            // Keep the pipe from refilling while probing.
            rate.app_limited = (rate.delivered + tcb.bytes_in_flight as u64).max(1);
            let cwnd_min_target = tcb.mss * CWND_MIN_TARGET_PKTS;
            if self.probe_rtt_done_stamp.is_none() && tcb.bytes_in_flight <= cwnd_min_target {
                self.probe_rtt_done_stamp = Some(now + self.config.probe_rtt_duration);
                self.probe_rtt_round_done = false;
                self.next_rtt_delivered = rate.delivered;
            } else if self.probe_rtt_done_stamp.is_some() {
                if self.round_start {
                    self.probe_rtt_round_done = true;
                }
                if self.probe_rtt_round_done {
                    self.check_probe_rtt_done(tcb, now);
                }
            }
        }
        if rs.delivered > 0 {
            self.idle_restart = false;
        }
    }

    fn save_cwnd(&mut self, tcb: &ControlBlock) {
        if self.prev_ca_state < TcpCongState::Recovery && self.mode != BbrMode::ProbeRtt {
            self.prior_cwnd = tcb.cwnd;
        } else {
            self.prior_cwnd = self.prior_cwnd.max(tcb.cwnd);
        }
    }

    fn check_probe_rtt_done(&mut self, tcb: &mut ControlBlock, now: Instant) {
        match self.probe_rtt_done_stamp {
            Some(done) if now > done => {}
            _ => return,
        }
        self.min_rtt_stamp = Some(now);
        tcb.cwnd = tcb.cwnd.max(self.prior_cwnd);
        self.reset_mode(now);
    }

    fn reset_mode(&mut self, now: Instant) {
        if !self.full_bw_reached {
            self.mode = BbrMode::Startup;
        } else {
            self.reset_probe_bw_mode(now);
        }
    }

    fn update_gains(&mut self) {
        let (pacing_gain, cwnd_gain) = match self.mode {
            BbrMode::Startup => (self.config.high_gain, self.config.high_gain),
            BbrMode::Drain => (DRAIN_GAIN, self.config.high_gain),
            BbrMode::ProbeBw if self.lt_use_bw => (1.0, CWND_GAIN),
            BbrMode::ProbeBw => (PACING_GAIN[self.cycle_idx], CWND_GAIN),
            BbrMode::ProbeRtt => (1.0, 1.0),
        };
        self.pacing_gain = pacing_gain;
        self.cwnd_gain = cwnd_gain;
    }

    fn set_pacing_rate(&mut self, tcb: &mut ControlBlock, gain: f64) {
        let rate = ((self.bw() as f64 * gain) as u64).min(tcb.max_pacing_rate);
        if !self.has_seen_rtt && !tcb.srtt.is_zero() {
            self.init_pacing_rate_from_rtt(tcb);
        }
        if self.full_bw_reached || rate > tcb.pacing_rate {
            tcb.pacing_rate = rate;
        }
    }

    fn init_pacing_rate_from_rtt(&mut self, tcb: &mut ControlBlock) {
        let rtt = if tcb.srtt.is_zero() {
            Duration::from_millis(1)
        } else {
            self.has_seen_rtt = true;
            tcb.srtt
        };
        let rate = tcb.cwnd as f64 / rtt.as_secs_f64() * self.config.high_gain * 0.99;
        tcb.pacing_rate = (rate as u64).min(tcb.max_pacing_rate);
    }

    fn set_cwnd(&mut self, tcb: &mut ControlBlock, rate: &mut RateConnection, rs: &RateSample) {
        let mut cwnd = tcb.cwnd;
        if rs.acked_sacked != 0 && !self.set_cwnd_to_recover_or_restore(tcb, rate, rs, &mut cwnd) {
            let mut target = self.bdp(tcb, self.bw(), self.cwnd_gain);
            target += self.ack_aggregation_cwnd(tcb);
            target = self.quantization_budget(tcb, target);
            if self.full_bw_reached {
                cwnd = (cwnd + rs.acked_sacked).min(target);
            } else if cwnd < target || rate.delivered < (tcb.initial_cwnd * tcb.mss) as u64 {
                cwnd += rs.acked_sacked;
            }
            cwnd = cwnd.max(tcb.mss * CWND_MIN_TARGET_PKTS);
        }
        tcb.cwnd = cwnd;
        if self.mode == BbrMode::ProbeRtt {
            tcb.cwnd = tcb.cwnd.min(tcb.mss * CWND_MIN_TARGET_PKTS);
        }
    }

    // Packet conservation on entering recovery, restore on leaving it. The
    // connection already removed lost bytes from bytes_in_flight.
    fn set_cwnd_to_recover_or_restore(
        &mut self,
        tcb: &ControlBlock,
        rate: &RateConnection,
        rs: &RateSample,
        new_cwnd: &mut u32,
    ) -> bool {
        let state = tcb.cong_state;
        let mut cwnd = tcb.cwnd;
        if state == TcpCongState::Recovery && self.prev_ca_state != TcpCongState::Recovery {
            self.packet_conservation = true;
            self.next_rtt_delivered = rate.delivered;
            cwnd = tcb.bytes_in_flight + rs.acked_sacked;
        } else if self.prev_ca_state >= TcpCongState::Recovery && state < TcpCongState::Recovery {
            cwnd = cwnd.max(self.prior_cwnd);
            self.packet_conservation = false;
        }
        self.prev_ca_state = state;
        if self.packet_conservation {
            *new_cwnd = cwnd.max(tcb.bytes_in_flight + rs.acked_sacked);
            return true;
        }
        *new_cwnd = cwnd;
        false
    }

    fn ack_aggregation_cwnd(&self, tcb: &ControlBlock) -> u32 {
        if !self.config.enable_ack_aggregation || EXTRA_ACK_GAIN == 0 || !self.full_bw_reached {
            return 0;
        }
        // At most 100 ms worth of data.
        let max_aggr = (self.bw() / 10).min(u32::MAX as u64) as u32;
        let aggr = (EXTRA_ACK_GAIN * self.extra_acked[0].max(self.extra_acked[1])).min(max_aggr);
        let tmp = aggr + tcb.mss - 1;
        tmp - (tmp % tcb.mss)
    }

    fn reset_lt_bw_sampling_interval(&mut self, tcb: &ControlBlock, rate: &RateConnection) {
        if !self.config.enable_long_term_bw {
            return;
        }
        self.lt_last_stamp = rate.delivered_time;
        self.lt_last_delivered = rate.delivered;
        self.lt_last_lost = tcb.total_lost;
        self.lt_rtt_cnt = 0;
    }

    fn reset_lt_bw_sampling(&mut self, tcb: &ControlBlock, rate: &RateConnection) {
        if !self.config.enable_long_term_bw {
            return;
        }
        self.lt_bw = 0;
        self.lt_use_bw = false;
        self.lt_is_sampling = false;
        self.reset_lt_bw_sampling_interval(tcb, rate);
    }

    fn lt_bw_interval_done(&mut self, tcb: &ControlBlock, rate: &RateConnection, bw: u64) {
        if self.lt_bw != 0 {
            let diff = bw.abs_diff(self.lt_bw);
            if diff as f64 <= LT_BW_RATIO * self.lt_bw as f64 || diff <= LT_BW_DIFF {
                // Two consistent intervals: a token bucket policer is likely.
                self.lt_bw = (bw + self.lt_bw) / 2;
                self.lt_use_bw = true;
                self.pacing_gain = 1.0;
                self.lt_rtt_cnt = 0;
                log::debug!("BBR detected a policer, using long-term bw {} B/s.", self.lt_bw);
                return;
            }
        }
        self.lt_bw = bw;
        self.reset_lt_bw_sampling_interval(tcb, rate);
    }

    fn lt_bw_sampling(&mut self, tcb: &ControlBlock, rate: &RateConnection, rs: &RateSample) {
        if !self.config.enable_long_term_bw {
            return;
        }
        if self.lt_use_bw {
            if self.mode == BbrMode::ProbeBw && self.round_start {
                self.lt_rtt_cnt += 1;
                if self.lt_rtt_cnt >= LT_BW_MAX_RTTS {
                    self.reset_lt_bw_sampling(tcb, rate);
                    let now = rate.delivered_time;
                    if let Some(now) = now {
                        self.reset_probe_bw_mode(now);
                    }
                }
            }
            return;
        }
        if !self.lt_is_sampling {
            if rs.bytes_loss == 0 {
                return;
            }
            self.reset_lt_bw_sampling_interval(tcb, rate);
            self.lt_is_sampling = true;
        }
        if rs.is_app_limited {
            self.reset_lt_bw_sampling(tcb, rate);
            return;
        }
        if self.round_start {
            self.lt_rtt_cnt += 1;
        }
        if self.lt_rtt_cnt < LT_INTERVAL_MIN_RTTS {
            return;
        }
        if self.lt_rtt_cnt > 4 * LT_INTERVAL_MIN_RTTS {
            self.reset_lt_bw_sampling(tcb, rate);
        }
        if rs.bytes_loss == 0 {
            return;
        }
        let lost = tcb.total_lost - self.lt_last_lost;
        let delivered = rate.delivered - self.lt_last_delivered;
        // Only lossy intervals (>= 20% loss) are policer candidates.
        if delivered == 0 || lost * 5 < delivered {
            return;
        }
        let elapsed = match (rate.delivered_time, self.lt_last_stamp) {
            (Some(delivered_time), Some(last)) => delivered_time.saturating_duration_since(last),
            _ => return,
        };
        if elapsed < Duration::from_millis(1) {
            return;
        }
        let bw = (delivered as f64 / elapsed.as_secs_f64()) as u64;
        self.lt_bw_interval_done(tcb, rate, bw);
    }
}

impl CongestionOps for Bbr {
    fn name(&self) -> &'static str {
        "TcpBbr"
    }

    fn init(&mut self, tcb: &mut ControlBlock, rate: &RateConnection, now: Instant) {
        if !self.initialized {
            self.bbr_init(tcb, rate, now);
        }
    }

    /// BBR does not reduce ssthresh on loss, it only remembers the window.
    fn ssthresh(&mut self, tcb: &ControlBlock, _bytes_in_flight: u32) -> u32 {
        self.save_cwnd(tcb);
        tcb.ssthresh
    }

    fn cong_state_set(
        &mut self,
        tcb: &mut ControlBlock,
        new_state: TcpCongState,
        rate: &RateConnection,
        now: Instant,
    ) {
        if new_state == TcpCongState::Open && !self.initialized {
            self.bbr_init(tcb, rate, now);
            return;
        }
        if new_state == TcpCongState::Loss {
            self.prev_ca_state = TcpCongState::Loss;
            self.full_bw = 0;
            self.round_start = true;
            let rs = RateSample {
                bytes_loss: tcb.mss,
                valid: true,
                ..Default::default()
            };
            self.lt_bw_sampling(tcb, rate, &rs);
        }
    }

    fn cwnd_event(
        &mut self,
        tcb: &mut ControlBlock,
        event: TcpCaEvent,
        rate: &RateConnection,
        now: Instant,
    ) {
        if event == TcpCaEvent::TxStart && rate.app_limited != 0 {
            self.idle_restart = true;
            self.ack_epoch_stamp = Some(now);
            self.ack_epoch_acked = 0;
            match self.mode {
                BbrMode::ProbeBw => self.set_pacing_rate(tcb, 1.0),
                BbrMode::ProbeRtt => self.check_probe_rtt_done(tcb, now),
                _ => {}
            }
        }
    }

    fn has_cong_control(&self) -> bool {
        true
    }

    fn cong_control(
        &mut self,
        tcb: &mut ControlBlock,
        rate: &mut RateConnection,
        sample: &RateSample,
        now: Instant,
    ) {
        if !self.initialized {
            self.bbr_init(tcb, rate, now);
        }
        self.update_model(tcb, rate, sample, now);
        self.set_pacing_rate(tcb, self.pacing_gain);
        self.set_cwnd(tcb, rate, sample);
    }

    fn fork(&self) -> Box<dyn CongestionOps> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod bbr_tests {
    use super::*;
    use crate::config::TcpConfig;
    use rstest::rstest;

    const MSS: u32 = 1000;
    const RTT: Duration = Duration::from_millis(100);

    fn setup() -> (Bbr, ControlBlock, RateConnection, Instant) {
        let config = TcpConfig {
            segment_size: MSS,
            ..Default::default()
        };
        let mut tcb = ControlBlock::new(&config);
        tcb.min_rtt = Some(RTT);
        tcb.srtt = RTT;
        let rate = RateConnection::default();
        let now = Instant::now();
        let mut bbr = Bbr::new(BbrConfig::default());
        bbr.init(&mut tcb, &rate, now);
        (bbr, tcb, rate, now)
    }

    // One ACK per round delivering `delivered` bytes at `bw` B/s.
    fn round(
        bbr: &mut Bbr,
        tcb: &mut ControlBlock,
        rate: &mut RateConnection,
        now: Instant,
        delivered: u64,
        bw: u64,
        rtt: Duration,
    ) {
        let prior_delivered = rate.delivered;
        rate.delivered += delivered;
        rate.delivered_time = Some(now);
        let sample = RateSample {
            delivery_rate: bw,
            interval: rtt,
            delivered,
            prior_delivered,
            prior_time: Some(now - rtt),
            acked_sacked: delivered as u32,
            prior_in_flight: tcb.bytes_in_flight,
            rtt: Some(rtt),
            valid: true,
            ..Default::default()
        };
        bbr.cong_control(tcb, rate, &sample, now);
    }

    #[test]
    fn test_bbr_init_enables_pacing() {
        let (bbr, tcb, _, _) = setup();
        assert!(tcb.pacing);
        assert_eq!(bbr.mode(), BbrMode::Startup);
        let expected = (10_000.0 / 0.1 * 2.88539 * 0.99) as u64;
        assert_eq!(tcb.pacing_rate, expected);
    }

    #[test]
    fn test_bbr_startup_drain_probe_bw() {
        let (mut bbr, mut tcb, mut rate, mut now) = setup();
        tcb.bytes_in_flight = 5000;
        for _ in 0..3 {
            now += RTT;
            round(&mut bbr, &mut tcb, &mut rate, now, 10_000, 100_000, RTT);
            assert_eq!(bbr.mode(), BbrMode::Startup);
        }
        now += RTT;
        round(&mut bbr, &mut tcb, &mut rate, now, 10_000, 100_000, RTT);
        assert!(bbr.full_bw_reached);
        // Drained immediately since inflight is already below one BDP.
        assert_eq!(bbr.mode(), BbrMode::ProbeBw);
        assert_ne!(bbr.cycle_idx, 1);
        assert_eq!(bbr.cwnd_gain, CWND_GAIN);
        assert_eq!(tcb.pacing_rate, (100_000.0 * bbr.pacing_gain) as u64);
        assert!(tcb.cwnd >= 4 * MSS);
    }

    #[test]
    fn test_bbr_probe_rtt_after_window_expiry() {
        let (mut bbr, mut tcb, mut rate, mut now) = setup();
        tcb.bytes_in_flight = 3000;
        for _ in 0..4 {
            now += RTT;
            round(&mut bbr, &mut tcb, &mut rate, now, 10_000, 100_000, RTT);
        }
        now += Duration::from_secs(11);
        round(&mut bbr, &mut tcb, &mut rate, now, 10_000, 100_000, RTT + RTT / 2);
        assert_eq!(bbr.mode(), BbrMode::ProbeRtt);
        assert_eq!(tcb.cwnd, 4 * MSS);
        assert_eq!(bbr.min_rtt, Some(RTT + RTT / 2));
        assert!(rate.app_limited > 0);

        now += Duration::from_millis(300);
        round(&mut bbr, &mut tcb, &mut rate, now, 3000, 100_000, RTT);
        assert_eq!(bbr.mode(), BbrMode::ProbeBw);
        assert!(tcb.cwnd > 4 * MSS);
    }

    #[test]
    fn test_bbr_packet_conservation_in_recovery() {
        let (mut bbr, mut tcb, mut rate, mut now) = setup();
        tcb.bytes_in_flight = 8000;
        now += RTT;
        round(&mut bbr, &mut tcb, &mut rate, now, 2000, 100_000, RTT);
        tcb.cong_state = TcpCongState::Recovery;
        tcb.bytes_in_flight = 6000;
        now += Duration::from_millis(10);
        round(&mut bbr, &mut tcb, &mut rate, now, 1000, 100_000, RTT);
        assert!(bbr.packet_conservation);
        assert_eq!(tcb.cwnd, 7000);
    }

    #[rstest]
    #[case(BbrMode::Startup, 2.88539, 2.88539)]
    #[case(BbrMode::Drain, DRAIN_GAIN, 2.88539)]
    #[case(BbrMode::ProbeRtt, 1.0, 1.0)]
    fn test_bbr_gains(#[case] mode: BbrMode, #[case] pacing: f64, #[case] cwnd: f64) {
        let mut bbr = Bbr::new(BbrConfig::default());
        bbr.mode = mode;
        bbr.update_gains();
        assert_eq!(bbr.pacing_gain, pacing);
        assert_eq!(bbr.cwnd_gain, cwnd);
    }

    #[test]
    fn test_bbr_ssthresh_keeps_value_and_saves_cwnd() {
        let (mut bbr, mut tcb, _, _) = setup();
        tcb.cwnd = 42_000;
        tcb.ssthresh = 12_345;
        assert_eq!(bbr.ssthresh(&tcb, 10_000), 12_345);
        assert_eq!(bbr.prior_cwnd, 42_000);
    }
}
