use super::congestion::ControlBlock;

// Proportional Rate Reduction, rfc6937, with the slow start reduction bound.
//
// "The PRR algorithm determines the number of segments to be sent per ACK
// during recovery to balance two goals: 1) a quick and accurate adjustment of
// the congestion window in response to losses, and 2) recovery
// transmissions that are paced by the ACK clock."

#[derive(Debug, Clone, Default)]
pub struct PrrRecovery {
    /// Bytes delivered to the receiver since recovery started.
    prr_delivered: u32,
    /// Bytes sent since recovery started.
    prr_out: u32,
    /// cwnd at the start of recovery, `RecoverFS` in the rfc.
    recover_fs: u32,
}

impl PrrRecovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called right after ssthresh was lowered.
    pub fn enter_recovery(&mut self, tcb: &mut ControlBlock, delivered_bytes: u32) {
        self.prr_out = 0;
        self.prr_delivered = 0;
        self.recover_fs = tcb.cwnd.max(1);
        self.do_recovery(tcb, delivered_bytes);
    }

    /// Sets cwnd so that `bytes_in_flight + sndcnt` may be outstanding after this ACK.
    pub fn do_recovery(&mut self, tcb: &mut ControlBlock, delivered_bytes: u32) {
        self.prr_delivered += delivered_bytes;
        let pipe = tcb.bytes_in_flight;
        let mut send_count: i64 = if pipe > tcb.ssthresh {
            // Proportional part: sndcnt = CEIL(prr_delivered * ssthresh / RecoverFS) - prr_out
            let target = (self.prr_delivered as u64 * tcb.ssthresh as u64)
                .div_ceil(self.recover_fs as u64);
            target as i64 - self.prr_out as i64
        } else {
            // Slow start reduction bound.
            let limit =
                (self.prr_delivered as i64 - self.prr_out as i64).max(delivered_bytes as i64);
            limit.min(tcb.ssthresh as i64 - pipe as i64)
        };
        // Force a fast retransmit upon entering recovery.
        let floor = if self.prr_out > 0 { 0 } else { tcb.mss as i64 };
        send_count = send_count.max(floor);
        tcb.cwnd = (pipe as i64 + send_count).clamp(0, u32::MAX as i64) as u32;
        log::trace!(
            "PRR delivered {} out {} pipe {} sndcnt {} -> cwnd {}.",
            self.prr_delivered,
            self.prr_out,
            pipe,
            send_count,
            tcb.cwnd
        );
    }

    pub fn exit_recovery(&mut self, tcb: &mut ControlBlock) {
        tcb.cwnd = tcb.ssthresh;
    }

    pub fn update_bytes_sent(&mut self, bytes_sent: u32) {
        self.prr_out += bytes_sent;
    }
}
