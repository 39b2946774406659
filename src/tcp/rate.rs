use super::seq::SequenceNumber32;
use super::tx_buffer::TxSegment;
use std::time::{Duration, Instant};

// Delivery rate estimation, draft-cheng-iccrg-delivery-rate-estimation.
// Each transmitted segment snapshots the connection's delivery state; when it
// is acked or sacked the snapshot of the most recently sent segment becomes
// the start of the sampling interval.

/// Per segment snapshot taken at transmission time.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RateSnapshot {
    pub first_sent: Option<Instant>,
    /// `None` once the segment has been counted as delivered.
    pub delivered_time: Option<Instant>,
    pub delivered: u64,
    pub is_app_limited: bool,
}

/// Connection-wide delivery counters.
#[derive(Debug, Clone, Default)]
pub struct RateConnection {
    pub delivered: u64,
    pub delivered_time: Option<Instant>,
    pub first_sent_time: Option<Instant>,
    /// Delivered count at which the app-limited phase ends, 0 when not limited.
    pub app_limited: u64,
}

/// Result of one ACK's worth of rate sampling.
#[derive(Debug, Clone, Default)]
pub struct RateSample {
    /// Bytes per second, only meaningful when `valid`.
    pub delivery_rate: u64,
    pub is_app_limited: bool,
    pub interval: Duration,
    pub delivered: u64,
    pub prior_delivered: u64,
    pub prior_time: Option<Instant>,
    pub send_elapsed: Duration,
    pub ack_elapsed: Duration,
    pub bytes_loss: u32,
    pub prior_in_flight: u32,
    pub acked_sacked: u32,
    pub rtt: Option<Duration>,
    pub valid: bool,
}

#[derive(Debug, Default)]
pub struct RateSampler {
    pub conn: RateConnection,
    pub sample: RateSample,
}

impl RateSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called at the start of every ACK so samples never carry over.
    pub fn begin_ack(&mut self) {
        self.sample = RateSample::default();
    }

    /// `start_of_transmission` is true when nothing was in flight before this segment.
    pub fn skb_sent(&mut self, segment: &mut TxSegment, start_of_transmission: bool, now: Instant) {
        if start_of_transmission {
            self.conn.first_sent_time = Some(now);
            self.conn.delivered_time = Some(now);
        }
        segment.rate = RateSnapshot {
            first_sent: self.conn.first_sent_time,
            delivered_time: self.conn.delivered_time,
            delivered: self.conn.delivered,
            is_app_limited: self.conn.app_limited != 0,
        };
    }

    pub fn skb_delivered(&mut self, segment: &mut TxSegment, now: Instant) {
        let Some(snapshot_delivered_time) = segment.rate.delivered_time else {
            return;
        };
        self.conn.delivered += segment.len() as u64;
        self.conn.delivered_time = Some(now);

        if self.sample.prior_delivered == 0 || segment.rate.delivered > self.sample.prior_delivered
        {
            self.sample.prior_delivered = segment.rate.delivered;
            self.sample.prior_time = Some(snapshot_delivered_time);
            self.sample.is_app_limited = segment.rate.is_app_limited;
            self.sample.send_elapsed = match (segment.last_sent, segment.rate.first_sent) {
                (Some(last), Some(first)) => last.saturating_duration_since(first),
                _ => Duration::ZERO,
            };
            self.sample.ack_elapsed = now.saturating_duration_since(snapshot_delivered_time);
            self.conn.first_sent_time = segment.last_sent;
        }
        segment.rate.delivered_time = None;
    }

    /// Returns whether the sample taken during this ACK is usable.
    pub fn generate_sample(
        &mut self,
        delivered: u32,
        lost: u32,
        is_sack_reneg: bool,
        prior_in_flight: u32,
        min_rtt: Option<Duration>,
    ) -> bool {
        if self.conn.app_limited != 0 && self.conn.delivered > self.conn.app_limited {
            self.conn.app_limited = 0;
        }
        self.sample.acked_sacked = delivered;
        self.sample.bytes_loss = lost;
        self.sample.prior_in_flight = prior_in_flight;
        self.sample.valid = false;

        if self.sample.prior_time.is_none() || is_sack_reneg {
            return false;
        }
        self.sample.delivered = self.conn.delivered - self.sample.prior_delivered;

        // Use the longer of the send and ack phases so ACK compression
        // cannot inflate the estimate.
        self.sample.interval = self.sample.send_elapsed.max(self.sample.ack_elapsed);
        if self.sample.interval.is_zero() {
            return false;
        }
        if let Some(min_rtt) = min_rtt {
            if self.sample.interval < min_rtt {
                log::trace!(
                    "Rate sample interval {:?} below min_rtt {:?}, discarded.",
                    self.sample.interval,
                    min_rtt
                );
                return false;
            }
        }
        self.sample.delivery_rate =
            (self.sample.delivered as u128 * 1_000_000_000 / self.sample.interval.as_nanos()) as u64;
        self.sample.valid = true;
        true
    }

    /// Marks the connection app-limited when the application left the pipe unfilled.
    #[allow(clippy::too_many_arguments)]
    pub fn calculate_app_limited(
        &mut self,
        cwnd: u32,
        in_flight: u32,
        mss: u32,
        tail_seq: SequenceNumber32,
        next_tx: SequenceNumber32,
        lost_out: u32,
        retrans_out: u32,
    ) {
        if next_tx.distance_to(tail_seq) < mss && in_flight < cwnd && lost_out <= retrans_out {
            self.conn.app_limited = (self.conn.delivered + in_flight as u64).max(1);
            log::trace!("Connection is app limited until {} delivered.", self.conn.app_limited);
        }
    }
}
