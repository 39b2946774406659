//! Congestion controllers behind a single interface.
//!
//! Window based controllers (CUBIC) adjust `cwnd` through `increase_window`
//! and `ssthresh`, leaving loss recovery to PRR in the connection. Model based
//! controllers (BBR) return true from `has_cong_control` and own both `cwnd`
//! and the pacing rate through `cong_control`, called once per ACK with the
//! delivery rate sample.

pub mod bbr;
pub mod cubic;
pub mod filter;

use super::defs::{EcnState, TcpCaEvent, TcpCongState};
use super::rate::{RateConnection, RateSample};
use super::seq::SequenceNumber32;
use crate::config::{CongestionKind, StackConfig, TcpConfig};
use std::fmt::Debug;
use std::time::{Duration, Instant};

pub use bbr::Bbr;
pub use cubic::Cubic;

/// Transport state shared between a connection and its congestion controller.
#[derive(Debug, Clone)]
pub struct ControlBlock {
    pub cwnd: u32,
    pub ssthresh: u32,
    pub mss: u32,
    /// In segments.
    pub initial_cwnd: u32,
    pub min_rtt: Option<Duration>,
    pub srtt: Duration,
    pub last_rtt: Option<Duration>,
    pub pacing: bool,
    /// Bytes per second.
    pub pacing_rate: u64,
    pub max_pacing_rate: u64,
    /// Earliest departure time of the next paced segment.
    pub tx_timestamp: Option<Instant>,
    pub cong_state: TcpCongState,
    pub ecn_state: EcnState,
    pub high_tx_mark: SequenceNumber32,
    pub next_tx_seq: SequenceNumber32,
    pub last_acked_seq: SequenceNumber32,
    pub bytes_in_flight: u32,
    pub is_cwnd_limited: bool,
    pub total_lost: u64,
}

impl ControlBlock {
    pub fn new(config: &TcpConfig) -> Self {
        Self {
            cwnd: config.initial_cwnd * config.segment_size,
            ssthresh: config.initial_ssthresh,
            mss: config.segment_size,
            initial_cwnd: config.initial_cwnd,
            min_rtt: None,
            srtt: Duration::ZERO,
            last_rtt: None,
            pacing: config.pacing,
            pacing_rate: config.max_pacing_rate,
            max_pacing_rate: config.max_pacing_rate,
            tx_timestamp: None,
            cong_state: TcpCongState::Open,
            ecn_state: EcnState::Disabled,
            high_tx_mark: SequenceNumber32::default(),
            next_tx_seq: SequenceNumber32::default(),
            last_acked_seq: SequenceNumber32::default(),
            bytes_in_flight: 0,
            is_cwnd_limited: false,
            total_lost: 0,
        }
    }

    pub fn cwnd_in_segments(&self) -> u32 {
        self.cwnd / self.mss
    }

    pub fn in_slow_start(&self) -> bool {
        self.cwnd < self.ssthresh
    }
}

/// Operations every congestion controller implements.
pub trait CongestionOps: Debug + Send {
    fn name(&self) -> &'static str;

    /// Called once the connection is established.
    #[allow(unused_variables)]
    fn init(&mut self, tcb: &mut ControlBlock, rate: &RateConnection, now: Instant) {}

    /// Slow start threshold after a loss or ECN signal.
    fn ssthresh(&mut self, tcb: &ControlBlock, bytes_in_flight: u32) -> u32;

    #[allow(unused_variables)]
    fn increase_window(&mut self, tcb: &mut ControlBlock, segments_acked: u32, now: Instant) {}

    /// Called on every ACK that acknowledged new data.
    #[allow(unused_variables)]
    fn pkts_acked(
        &mut self,
        tcb: &mut ControlBlock,
        segments_acked: u32,
        rtt: Option<Duration>,
        now: Instant,
    ) {
    }

    #[allow(unused_variables)]
    fn cong_state_set(
        &mut self,
        tcb: &mut ControlBlock,
        new_state: TcpCongState,
        rate: &RateConnection,
        now: Instant,
    ) {
    }

    #[allow(unused_variables)]
    fn cwnd_event(
        &mut self,
        tcb: &mut ControlBlock,
        event: TcpCaEvent,
        rate: &RateConnection,
        now: Instant,
    ) {
    }

    /// True when `cong_control` replaces window growth and PRR.
    fn has_cong_control(&self) -> bool {
        false
    }

    #[allow(unused_variables)]
    fn cong_control(
        &mut self,
        tcb: &mut ControlBlock,
        rate: &mut RateConnection,
        sample: &RateSample,
        now: Instant,
    ) {
    }

    /// Copy for a connection forked from a listener.
    fn fork(&self) -> Box<dyn CongestionOps>;
}

pub fn new_congestion_ops(kind: CongestionKind, config: &StackConfig) -> Box<dyn CongestionOps> {
    match kind {
        CongestionKind::Cubic => Box::new(Cubic::new(config.cubic.clone())),
        CongestionKind::Bbr => Box::new(Bbr::new(config.bbr.clone())),
    }
}
