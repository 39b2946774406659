use super::{CongestionOps, ControlBlock};
use crate::config::CubicConfig;
use crate::tcp::defs::{TcpCaEvent, TcpCongState};
use crate::tcp::rate::RateConnection;
use crate::tcp::seq::SequenceNumber32;
use std::time::{Duration, Instant};

/// CUBIC (rfc8312) with HyStart, in the Linux integer style: the window
/// grows by one segment every `cnt` acked segments.
#[derive(Debug, Clone)]
pub struct Cubic {
    config: CubicConfig,
    beta_scale: f64,
    cwnd_cnt: u32,
    last_max_cwnd: u32,
    bic_origin_point: u32,
    bic_k: f64,
    delay_min: Duration,
    epoch_start: Option<Instant>,
    ack_cnt: u32,
    tcp_seg_cwnd: u32,
    // HyStart
    found: bool,
    round_start: Option<Instant>,
    end_seq: SequenceNumber32,
    last_ack: Option<Instant>,
    curr_rtt: Option<Duration>,
    sample_cnt: u32,
}

impl Cubic {
    pub fn new(config: CubicConfig) -> Self {
        let beta_scale = (1.0 + config.beta) / (3.0 * (1.0 - config.beta));
        Self {
            config,
            beta_scale,
            cwnd_cnt: 0,
            last_max_cwnd: 0,
            bic_origin_point: 0,
            bic_k: 0.0,
            delay_min: Duration::ZERO,
            epoch_start: None,
            ack_cnt: 0,
            tcp_seg_cwnd: 0,
            found: false,
            round_start: None,
            end_seq: SequenceNumber32::default(),
            last_ack: None,
            curr_rtt: None,
            sample_cnt: 0,
        }
    }

    fn hystart_reset(&mut self, tcb: &ControlBlock, now: Instant) {
        self.round_start = Some(now);
        self.last_ack = Some(now);
        self.end_seq = tcb.high_tx_mark;
        self.curr_rtt = None;
        self.sample_cnt = 0;
    }

    fn cubic_reset(&mut self) {
        self.cwnd_cnt = 0;
        self.last_max_cwnd = 0;
        self.bic_origin_point = 0;
        self.bic_k = 0.0;
        self.delay_min = Duration::ZERO;
        self.epoch_start = None;
        self.ack_cnt = 0;
        self.tcp_seg_cwnd = 0;
        self.found = false;
    }

    /// Acked segments needed for one segment of growth.
    fn update(&mut self, tcb: &ControlBlock, segments_acked: u32, now: Instant) -> u32 {
        let seg_cwnd = tcb.cwnd_in_segments();
        self.ack_cnt += segments_acked;

        let epoch_start = match self.epoch_start {
            Some(start) => start,
            None => {
                self.epoch_start = Some(now);
                self.ack_cnt = segments_acked;
                self.tcp_seg_cwnd = seg_cwnd;
                if self.last_max_cwnd <= seg_cwnd {
                    self.bic_k = 0.0;
                    self.bic_origin_point = seg_cwnd;
                } else {
                    self.bic_k = ((self.last_max_cwnd - seg_cwnd) as f64 / self.config.c).cbrt();
                    self.bic_origin_point = self.last_max_cwnd;
                }
                now
            }
        };

        let t = (now.saturating_duration_since(epoch_start) + self.delay_min).as_secs_f64();
        let offs = (t - self.bic_k).abs();
        let delta = (self.config.c * offs.powi(3)) as u32;
        let bic_target = if t < self.bic_k {
            self.bic_origin_point.saturating_sub(delta)
        } else {
            self.bic_origin_point.saturating_add(delta)
        };

        let mut cnt = if bic_target > seg_cwnd {
            seg_cwnd / (bic_target - seg_cwnd)
        } else {
            100 * seg_cwnd
        };
        if self.last_max_cwnd == 0 && cnt > self.config.cnt_clamp {
            cnt = self.config.cnt_clamp;
        }

        if self.config.tcp_friendliness {
            let delta = ((seg_cwnd as f64 * self.beta_scale) as u32).max(1);
            self.tcp_seg_cwnd += self.ack_cnt / delta;
            self.ack_cnt %= delta;
            if self.tcp_seg_cwnd > seg_cwnd {
                let max_cnt = seg_cwnd / (self.tcp_seg_cwnd - seg_cwnd);
                cnt = cnt.min(max_cnt);
            }
        }
        cnt.max(2)
    }

    fn hystart_update(&mut self, tcb: &mut ControlBlock, delay: Duration, now: Instant) {
        if tcb.last_acked_seq > self.end_seq {
            self.hystart_reset(tcb, now);
        }

        if self.config.hystart_detect.train() {
            let close_to_last = self
                .last_ack
                .is_some_and(|last| now.saturating_duration_since(last) <= self.config.hystart_ack_delta);
            if close_to_last {
                self.last_ack = Some(now);
                let mut ack_delay = Duration::ZERO;
                if tcb.pacing_rate != 0 {
                    let four_segments =
                        Duration::from_secs_f64((tcb.mss * 4) as f64 / tcb.pacing_rate as f64);
                    ack_delay = four_segments.min(Duration::from_millis(1));
                }
                if !tcb.pacing {
                    ack_delay /= 2;
                }
                let threshold = self.delay_min + ack_delay;
                let train_len = self
                    .round_start
                    .map_or(Duration::ZERO, |start| now.saturating_duration_since(start));
                if train_len > threshold {
                    self.found = true;
                    tcb.ssthresh = tcb.cwnd;
                    log::debug!(
                        "HyStart ack train exceeded {:?}, ssthresh={}.",
                        threshold,
                        tcb.ssthresh
                    );
                }
            }
        }

        if self.config.hystart_detect.delay() {
            self.curr_rtt = Some(self.curr_rtt.map_or(delay, |curr| curr.min(delay)));
            if self.sample_cnt < self.config.hystart_min_samples {
                self.sample_cnt += 1;
            } else if let Some(curr) = self.curr_rtt {
                let thresh = (self.delay_min / 8)
                    .clamp(self.config.hystart_delay_min, self.config.hystart_delay_max);
                if curr > self.delay_min + thresh {
                    self.found = true;
                    tcb.ssthresh = tcb.cwnd;
                    log::debug!(
                        "HyStart delay increase {:?} > {:?}, ssthresh={}.",
                        curr,
                        self.delay_min + thresh,
                        tcb.ssthresh
                    );
                }
            }
        }
    }
}

impl CongestionOps for Cubic {
    fn name(&self) -> &'static str {
        "TcpCubic"
    }

    fn init(&mut self, tcb: &mut ControlBlock, _rate: &RateConnection, now: Instant) {
        self.cubic_reset();
        if self.config.hystart {
            self.hystart_reset(tcb, now);
        }
    }

    fn ssthresh(&mut self, tcb: &ControlBlock, bytes_in_flight: u32) -> u32 {
        let seg_cwnd = tcb.cwnd_in_segments();
        // Fast convergence, rfc8312 section 4.6
        if seg_cwnd < self.last_max_cwnd && self.config.fast_convergence {
            self.last_max_cwnd = (seg_cwnd as f64 * (1.0 + self.config.beta) / 2.0) as u32;
        } else {
            self.last_max_cwnd = seg_cwnd;
        }
        self.epoch_start = None;
        let ssthresh = ((seg_cwnd as f64 * self.config.beta) as u32).max(2) * tcb.mss;
        log::trace!(
            "Cubic ssthresh {} (cwnd {} segments, {} bytes in flight, w_max {}).",
            ssthresh,
            seg_cwnd,
            bytes_in_flight,
            self.last_max_cwnd
        );
        ssthresh
    }

    fn increase_window(&mut self, tcb: &mut ControlBlock, mut segments_acked: u32, now: Instant) {
        if segments_acked == 0 {
            return;
        }
        if tcb.cwnd < tcb.ssthresh {
            let cwnd = tcb
                .cwnd
                .saturating_add(segments_acked * tcb.mss)
                .min(tcb.ssthresh);
            segments_acked -= ((cwnd - tcb.cwnd) / tcb.mss).min(segments_acked);
            tcb.cwnd = cwnd;
        }
        if segments_acked == 0 {
            return;
        }
        self.cwnd_cnt += segments_acked;
        let cnt = self.update(tcb, segments_acked, now);
        if self.cwnd_cnt >= cnt {
            tcb.cwnd += tcb.mss;
            self.cwnd_cnt -= cnt;
        }
    }

    fn pkts_acked(
        &mut self,
        tcb: &mut ControlBlock,
        _segments_acked: u32,
        rtt: Option<Duration>,
        now: Instant,
    ) {
        let Some(rtt) = rtt else {
            return;
        };
        // Delay samples right after recovery are unreliable.
        if let Some(epoch_start) = self.epoch_start {
            if now.saturating_duration_since(epoch_start) < self.config.cubic_delta {
                return;
            }
        }
        if self.delay_min.is_zero() || self.delay_min > rtt {
            self.delay_min = rtt;
        }
        if !self.found
            && self.config.hystart
            && tcb.cwnd < tcb.ssthresh
            && tcb.cwnd >= self.config.hystart_low_window * tcb.mss
        {
            self.hystart_update(tcb, rtt, now);
        }
    }

    fn cong_state_set(
        &mut self,
        tcb: &mut ControlBlock,
        new_state: TcpCongState,
        _rate: &RateConnection,
        now: Instant,
    ) {
        if new_state == TcpCongState::Loss {
            self.cubic_reset();
            self.hystart_reset(tcb, now);
        }
    }

    fn cwnd_event(
        &mut self,
        tcb: &mut ControlBlock,
        event: TcpCaEvent,
        _rate: &RateConnection,
        now: Instant,
    ) {
        // Sending resumes from idle, the next round ends at what goes out now.
        if matches!(event, TcpCaEvent::TxStart | TcpCaEvent::CwndRestart) && self.config.hystart {
            self.hystart_reset(tcb, now);
        }
    }

    fn fork(&self) -> Box<dyn CongestionOps> {
        Box::new(self.clone())
    }
}
