use super::defs::TcpCongState;
use super::packet::SackBlock;
use super::rate::RateSnapshot;
use super::seq::SequenceNumber32;
use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound::{Excluded, Unbounded};
use std::ops::{Index, IndexMut};
use std::time::{Duration, Instant};

pub type SegmentId = usize;

/// One transmitted (or about to be transmitted) range of the send stream.
#[derive(Debug, Clone, Default)]
pub struct TxSegment {
    pub start_seq: SequenceNumber32,
    pub payload: Vec<u8>,
    pub last_sent: Option<Instant>,
    pub sacked: bool,
    pub lost: bool,
    pub retrans: bool,
    /// Set when the segment was retransmitted in a way that makes its RTT ambiguous.
    pub rtt_unreliable: bool,
    pub rate: RateSnapshot,
    // Key in the transmit-time order, `None` when not a member. Pieces of a
    // split share the counter and are ordered by start sequence.
    ts_pos: Option<(u64, SequenceNumber32)>,
}

impl TxSegment {
    pub fn new(start_seq: SequenceNumber32, payload: Vec<u8>) -> Self {
        Self {
            start_seq,
            payload,
            ..Default::default()
        }
    }

    pub fn len(&self) -> u32 {
        self.payload.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn end_seq(&self) -> SequenceNumber32 {
        self.start_seq + self.len()
    }
}

/// Inputs of RACK loss detection that live in the connection.
#[derive(Debug, Clone, Copy)]
pub struct RackParams {
    pub now: Instant,
    pub min_rtt: Option<Duration>,
    pub srtt: Duration,
    pub cong_state: TcpCongState,
}

#[derive(Debug, Default)]
struct SegmentArena {
    slots: Vec<Option<TxSegment>>,
    free: Vec<SegmentId>,
}

impl SegmentArena {
    fn insert(&mut self, segment: TxSegment) -> SegmentId {
        match self.free.pop() {
            Some(id) => {
                self.slots[id] = Some(segment);
                id
            }
            None => {
                self.slots.push(Some(segment));
                self.slots.len() - 1
            }
        }
    }

    fn remove(&mut self, id: SegmentId) -> Option<TxSegment> {
        let segment = self.slots.get_mut(id)?.take();
        if segment.is_some() {
            self.free.push(id);
        }
        segment
    }
}

impl Index<SegmentId> for SegmentArena {
    type Output = TxSegment;

    fn index(&self, id: SegmentId) -> &TxSegment {
        match self.slots.get(id) {
            Some(Some(segment)) => segment,
            _ => panic!("Stale tx segment id {}.", id),
        }
    }
}

impl IndexMut<SegmentId> for SegmentArena {
    fn index_mut(&mut self, id: SegmentId) -> &mut TxSegment {
        match self.slots.get_mut(id) {
            Some(Some(segment)) => segment,
            _ => panic!("Stale tx segment id {}.", id),
        }
    }
}

/// Send buffer and SACK scoreboard.
///
/// Bytes the application wrote but which were never transmitted stay in a
/// flat byte queue. The first transmission carves them into `TxSegment`s kept
/// in `sent`, ordered by sequence number. Sent segments that are neither
/// sacked nor (lost and not retransmitted) are additionally linked into
/// `tsorted` by last transmission time, which is what RACK walks.
#[derive(Debug)]
pub struct TxBuffer {
    max_buffer_size: u32,
    // Unacked plus unsent bytes.
    size: u32,
    sent_size: u32,
    first_byte_seq: SequenceNumber32,
    app: VecDeque<u8>,
    arena: SegmentArena,
    sent: BTreeMap<SequenceNumber32, SegmentId>,
    tsorted: BTreeMap<(u64, SequenceNumber32), SegmentId>,
    ts_counter: u64,
    highest_sack: Option<SequenceNumber32>,
    recv_sack_cache: Vec<SackBlock>,
    sacked_pkts: u32,
    sacked_out: u32,
    lost_out: u32,
    retrans_out: u32,
    total_lost: u64,
    total_retrans: u64,
    rack_xmit_ts: Option<Instant>,
    rack_end_seq: SequenceNumber32,
    rack_rtt: Duration,
    reorder_timeout: Option<Duration>,
    sack_enabled: bool,
}

impl TxBuffer {
    pub fn new(max_buffer_size: u32, first_byte_seq: SequenceNumber32) -> Self {
        Self {
            max_buffer_size,
            size: 0,
            sent_size: 0,
            first_byte_seq,
            app: VecDeque::new(),
            arena: SegmentArena::default(),
            sent: BTreeMap::new(),
            tsorted: BTreeMap::new(),
            ts_counter: 0,
            highest_sack: None,
            recv_sack_cache: Vec::new(),
            sacked_pkts: 0,
            sacked_out: 0,
            lost_out: 0,
            retrans_out: 0,
            total_lost: 0,
            total_retrans: 0,
            rack_xmit_ts: None,
            rack_end_seq: SequenceNumber32::default(),
            rack_rtt: Duration::ZERO,
            reorder_timeout: None,
            sack_enabled: true,
        }
    }

    /// Only valid before any byte was written, e.g. once the ISS is chosen.
    pub fn set_head_sequence(&mut self, seq: SequenceNumber32) {
        debug_assert_eq!(self.size, 0);
        self.first_byte_seq = seq;
    }

    pub fn set_max_buffer_size(&mut self, max: u32) {
        self.max_buffer_size = max;
    }

    pub fn max_buffer_size(&self) -> u32 {
        self.max_buffer_size
    }

    pub fn set_sack_enabled(&mut self, enabled: bool) {
        self.sack_enabled = enabled;
    }

    pub fn is_sack_enabled(&self) -> bool {
        self.sack_enabled
    }

    pub fn head_sequence(&self) -> SequenceNumber32 {
        self.first_byte_seq
    }

    pub fn tail_sequence(&self) -> SequenceNumber32 {
        self.first_byte_seq + self.size
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn sent_size(&self) -> u32 {
        self.sent_size
    }

    pub fn available(&self) -> u32 {
        self.max_buffer_size.saturating_sub(self.size)
    }

    pub fn sacked_out(&self) -> u32 {
        self.sacked_out
    }

    pub fn lost_out(&self) -> u32 {
        self.lost_out
    }

    pub fn retrans_out(&self) -> u32 {
        self.retrans_out
    }

    pub fn total_lost(&self) -> u64 {
        self.total_lost
    }

    pub fn total_retrans(&self) -> u64 {
        self.total_retrans
    }

    pub fn sacked_packets(&self) -> u32 {
        self.sacked_pkts
    }

    pub fn segment(&self, id: SegmentId) -> &TxSegment {
        &self.arena[id]
    }

    pub fn segment_mut(&mut self, id: SegmentId) -> &mut TxSegment {
        &mut self.arena[id]
    }

    pub fn head_segment(&self) -> Option<&TxSegment> {
        self.sent.values().next().map(|&id| &self.arena[id])
    }

    pub fn sent_segments(&self) -> impl Iterator<Item = &TxSegment> {
        self.sent.values().map(|&id| &self.arena[id])
    }

    /// Appends application data, all or nothing.
    pub fn add(&mut self, data: &[u8]) -> bool {
        if data.len() as u32 > self.available() {
            log::trace!(
                "TxBuffer rejects {} bytes, only {} available.",
                data.len(),
                self.available()
            );
            return false;
        }
        self.app.extend(data);
        self.size += data.len() as u32;
        true
    }

    /// Bytes in the buffer from `seq` up to the tail.
    pub fn size_from_sequence(&self, seq: SequenceNumber32) -> u32 {
        seq.distance_to(self.tail_sequence())
    }

    /// Copies the byte at `seq` without marking anything as sent, for window probes.
    pub fn peek(&self, seq: SequenceNumber32, len: u32) -> Vec<u8> {
        let len = len.min(self.size_from_sequence(seq));
        let mut data = Vec::with_capacity(len as usize);
        let sent_end = self.first_byte_seq + self.sent_size;
        let mut cursor = seq;
        if cursor < sent_end {
            if let Some((_, &id)) = self.sent.range(..=cursor).next_back() {
                for (_, &id) in self.sent.range(self.arena[id].start_seq..) {
                    let segment = &self.arena[id];
                    if data.len() as u32 >= len {
                        break;
                    }
                    let from = (cursor - segment.start_seq) as usize;
                    let take = (len as usize - data.len()).min(segment.payload.len() - from);
                    data.extend_from_slice(&segment.payload[from..from + take]);
                    cursor += take as u32;
                }
            }
        }
        if (data.len() as u32) < len {
            let from = (cursor - sent_end) as usize;
            let take = len as usize - data.len();
            data.extend(self.app.iter().skip(from).take(take));
        }
        data
    }

    /// Hands out up to `num_bytes` starting at `seq` for transmission.
    ///
    /// Previously sent ranges are returned as retransmissions (merged or split
    /// so the returned segment covers exactly the copied range); a range
    /// starting at the end of the sent data is carved out of the unsent bytes.
    /// The returned segment is stamped with `now` and moved to the tail of the
    /// transmit-time order.
    pub fn copy_from_sequence(
        &mut self,
        num_bytes: u32,
        seq: SequenceNumber32,
        now: Instant,
    ) -> Option<SegmentId> {
        debug_assert!(seq >= self.first_byte_seq);
        let s = num_bytes.min(self.size_from_sequence(seq));
        if s == 0 {
            return None;
        }
        let sent_end = self.first_byte_seq + self.sent_size;
        let id = if sent_end >= seq + s {
            self.get_transmitted_segment(s, seq)
        } else if sent_end <= seq {
            debug_assert!(sent_end == seq, "sequence {} skips unsent data", seq);
            self.get_new_segment(s)
        } else {
            // Straddles the sent/unsent boundary, only copy the sent part.
            return self.copy_from_sequence((sent_end - seq) as u32, seq, now);
        };
        self.arena[id].last_sent = Some(now);
        self.tsorted_push_back(id);
        Some(id)
    }

    fn insert_sent(&mut self, seq: SequenceNumber32, id: SegmentId) {
        debug_assert!(
            seq.in_window(self.first_byte_seq),
            "sent key {} outside the window at {}",
            seq,
            self.first_byte_seq
        );
        self.sent.insert(seq, id);
    }

    fn get_new_segment(&mut self, num_bytes: u32) -> SegmentId {
        let payload: Vec<u8> = self.app.drain(..num_bytes as usize).collect();
        let start_seq = self.first_byte_seq + self.sent_size;
        let id = self.arena.insert(TxSegment {
            start_seq,
            payload,
            ..Default::default()
        });
        self.insert_sent(start_seq, id);
        self.sent_size += num_bytes;
        id
    }

    fn get_transmitted_segment(&mut self, num_bytes: u32, seq: SequenceNumber32) -> SegmentId {
        let mut s = num_bytes;
        if let Some(&id) = self.sent.get(&seq) {
            let current = &self.arena[id];
            let next = self
                .sent
                .range((Excluded(seq), Unbounded))
                .next()
                .map(|(_, &next_id)| &self.arena[next_id]);
            s = match next {
                Some(next) if !next.sacked && next.lost == current.lost => {
                    s.min(current.len() + next.len())
                }
                _ => s.min(current.len()),
            };
        }
        let id = self.get_packet_from_sent_buf(s, seq);
        let segment = &mut self.arena[id];
        // A resent segment that was never marked lost has no trustworthy send time.
        if !segment.lost {
            segment.rtt_unreliable = true;
        }
        if !segment.retrans {
            segment.retrans = true;
            self.retrans_out += segment.len();
        }
        self.total_retrans += segment.len() as u64;
        id
    }

    fn get_packet_from_sent_buf(&mut self, num_bytes: u32, seq: SequenceNumber32) -> SegmentId {
        loop {
            let (begin, id) = match self.sent.range(..=seq).next_back() {
                Some((&begin, &id)) => (begin, id),
                None => panic!("No sent segment contains {}.", seq),
            };
            if begin != seq {
                let front = self.split_front(id, (seq - begin) as u32);
                self.insert_sent(begin, front);
                self.insert_sent(seq, id);
            }
            let len = self.arena[id].len();
            if num_bytes == len {
                return id;
            }
            if num_bytes < len {
                let front = self.split_front(id, num_bytes);
                self.insert_sent(seq, front);
                self.insert_sent(seq + num_bytes, id);
                return front;
            }
            let next_seq = self.arena[id].end_seq();
            match self.sent.remove(&next_seq) {
                Some(next) => self.merge(id, next),
                None => return id,
            }
        }
    }

    // Detaches the first `size` bytes of `id` into a new segment carrying the
    // same flags and transmit time. The caller re-keys both in `sent`.
    fn split_front(&mut self, id: SegmentId, size: u32) -> SegmentId {
        let original = &mut self.arena[id];
        debug_assert!(size > 0 && size < original.len());
        let tail = original.payload.split_off(size as usize);
        let head = std::mem::replace(&mut original.payload, tail);
        let front = TxSegment {
            start_seq: original.start_seq,
            payload: head,
            last_sent: original.last_sent,
            sacked: original.sacked,
            lost: original.lost,
            retrans: original.retrans,
            rtt_unreliable: original.rtt_unreliable,
            rate: original.rate,
            ts_pos: None,
        };
        original.start_seq += size;
        let tail_start = original.start_seq;
        let ts_pos = original.ts_pos;
        if front.sacked {
            self.sacked_pkts += 1;
        }
        let front_start = front.start_seq;
        let front = self.arena.insert(front);
        if let Some((counter, old_start)) = ts_pos {
            self.tsorted.remove(&(counter, old_start));
            self.tsorted.insert((counter, front_start), front);
            self.tsorted.insert((counter, tail_start), id);
            self.arena[front].ts_pos = Some((counter, front_start));
            self.arena[id].ts_pos = Some((counter, tail_start));
        }
        front
    }

    // `second` must already be unlinked from `sent`.
    fn merge(&mut self, first: SegmentId, second: SegmentId) {
        self.tsorted_remove(second);
        let Some(mut t2) = self.arena.remove(second) else {
            return;
        };
        let t1 = &mut self.arena[first];
        debug_assert_eq!(t1.sacked, t2.sacked);
        debug_assert_eq!(t1.lost, t2.lost);
        if t1.retrans != t2.retrans {
            if t1.retrans {
                t1.retrans = false;
                self.retrans_out -= t1.len();
            } else {
                t2.retrans = false;
                self.retrans_out -= t2.len();
            }
        }
        t1.last_sent = t1.last_sent.max(t2.last_sent);
        t1.rtt_unreliable |= t2.rtt_unreliable;
        t1.payload.append(&mut t2.payload);
        if t2.sacked {
            self.sacked_pkts -= 1;
        }
    }

    fn tsorted_push_back(&mut self, id: SegmentId) {
        self.tsorted_remove(id);
        self.ts_counter += 1;
        let key = (self.ts_counter, self.arena[id].start_seq);
        self.tsorted.insert(key, id);
        self.arena[id].ts_pos = Some(key);
    }

    fn tsorted_remove(&mut self, id: SegmentId) {
        if let Some(pos) = self.arena[id].ts_pos.take() {
            self.tsorted.remove(&pos);
        }
    }

    fn remove_from_counts(&mut self, id: SegmentId, size: u32, whole: bool) {
        let segment = &self.arena[id];
        if segment.sacked {
            if whole {
                self.sacked_pkts -= 1;
            }
            self.sacked_out -= size;
        }
        if segment.retrans {
            self.retrans_out -= size;
        }
        if segment.lost {
            self.lost_out -= size;
        }
    }

    /// Releases everything below `seq` (a cumulative ACK). `on_delivered` sees
    /// each fully acked segment before it is freed.
    pub fn discard_up_to(
        &mut self,
        seq: SequenceNumber32,
        params: &RackParams,
        on_delivered: &mut dyn FnMut(&mut TxSegment),
    ) {
        if self.first_byte_seq >= seq {
            return;
        }
        let mut offset = (seq - self.first_byte_seq) as u32;
        while self.size > 0 && offset > 0 {
            let Some((&start, &id)) = self.sent.iter().next() else {
                // Acked before it was ever handed out.
                let first = self.first_byte_seq;
                if self.copy_from_sequence(offset, first, params.now).is_none() {
                    break;
                }
                continue;
            };
            let len = self.arena[id].len();
            if offset >= len {
                self.size -= len;
                self.sent_size -= len;
                offset -= len;
                self.first_byte_seq += len;
                on_delivered(&mut self.arena[id]);
                self.rack_update_most_recent(id, params);
                self.remove_from_counts(id, len, true);
                self.tsorted_remove(id);
                self.sent.remove(&start);
                self.arena.remove(id);
            } else {
                let segment = &mut self.arena[id];
                segment.payload.drain(..offset as usize);
                segment.start_seq += offset;
                let new_start = segment.start_seq;
                self.sent.remove(&start);
                self.insert_sent(new_start, id);
                self.size -= offset;
                self.sent_size -= offset;
                self.first_byte_seq += offset;
                self.remove_from_counts(id, offset, false);
                break;
            }
        }
        if self.size == 0 {
            self.first_byte_seq = seq;
        }

        // A sacked head means the receiver reneged or the ACK raced the SACK.
        let sacked_head = self
            .sent
            .values()
            .next()
            .copied()
            .filter(|&id| self.arena[id].sacked);
        if let Some(id) = sacked_head {
            let segment = &mut self.arena[id];
            segment.sacked = false;
            self.sacked_pkts -= 1;
            self.sacked_out -= segment.len();
            if !self.sack_enabled {
                self.add_reno_sack();
            }
            self.mark_head_as_lost();
        }

        if let Some(highest) = self.highest_sack {
            if highest <= self.first_byte_seq {
                self.highest_sack = None;
            }
        }
        self.consistency_check();
    }

    fn sack_block_update(
        &mut self,
        start: SequenceNumber32,
        end: SequenceNumber32,
        params: &RackParams,
        on_delivered: &mut dyn FnMut(&mut TxSegment),
    ) -> u32 {
        let mut bytes_sacked = 0;
        let candidates: Vec<(SequenceNumber32, SegmentId)> =
            self.sent.range(start..).map(|(&k, &v)| (k, v)).collect();
        for (begin, id) in candidates {
            let segment = &self.arena[id];
            let segment_end = segment.end_seq();
            if segment_end > end {
                break;
            }
            if segment.sacked {
                continue;
            }
            let len = segment.len();
            on_delivered(&mut self.arena[id]);
            self.rack_update_most_recent(id, params);
            let segment = &mut self.arena[id];
            if segment.retrans {
                segment.retrans = false;
                self.retrans_out -= len;
            }
            if segment.lost {
                segment.lost = false;
                self.lost_out -= len;
            }
            segment.sacked = true;
            self.tsorted_remove(id);
            self.sacked_pkts += 1;
            self.sacked_out += len;
            bytes_sacked += len;

            let advance = match self.highest_sack {
                None => true,
                Some(highest) => highest <= begin,
            };
            if advance {
                self.highest_sack = Some(begin);
            }
        }
        bytes_sacked
    }

    /// Applies the SACK blocks of one ACK and returns the newly sacked bytes.
    ///
    /// Blocks already seen in the previous ACK are skipped. When anything was
    /// newly sacked RACK runs and may arm a reorder timeout, see
    /// `take_reorder_timeout`.
    pub fn update(
        &mut self,
        sack_list: &[SackBlock],
        params: &RackParams,
        on_delivered: &mut dyn FnMut(&mut TxSegment),
    ) -> u32 {
        let mut list = sack_list.to_vec();
        list.sort();
        let cache = std::mem::take(&mut self.recv_sack_cache);
        let mut bytes_sacked = 0;
        let mut ci = 0;
        for &(block_start, block_end) in &list {
            let mut start = block_start;
            while ci < cache.len() {
                let (cached_start, cached_end) = cache[ci];
                if start >= cached_end {
                    ci += 1;
                    continue;
                }
                if block_end <= cached_start {
                    break;
                }
                if start < cached_start {
                    bytes_sacked +=
                        self.sack_block_update(start, cached_start, params, on_delivered);
                }
                start = cached_end;
                if block_end <= cached_end {
                    break;
                }
                ci += 1;
            }
            if start < block_end {
                bytes_sacked += self.sack_block_update(start, block_end, params, on_delivered);
            }
        }
        self.recv_sack_cache = list;
        if bytes_sacked > 0 {
            self.reorder_timeout = self.update_lost_count(params);
        }
        self.consistency_check();
        bytes_sacked
    }

    /// Reorder timeout computed by the last loss detection pass, if any segment is pending.
    pub fn take_reorder_timeout(&mut self) -> Option<Duration> {
        self.reorder_timeout.take()
    }

    fn rack_update_most_recent(&mut self, id: SegmentId, params: &RackParams) {
        let segment = &self.arena[id];
        if segment.rtt_unreliable {
            return;
        }
        let Some(xmit) = segment.last_sent else {
            return;
        };
        let rtt = params.now.saturating_duration_since(xmit);
        // A retransmission acked faster than min_rtt was probably the original.
        if segment.retrans && params.min_rtt.map_or(true, |min_rtt| rtt < min_rtt) {
            return;
        }
        let end = segment.end_seq();
        let newer = match self.rack_xmit_ts {
            None => true,
            Some(rack_xmit) => (xmit, end) > (rack_xmit, self.rack_end_seq),
        };
        if newer {
            self.rack_rtt = rtt;
            self.rack_xmit_ts = Some(xmit);
            self.rack_end_seq = end;
        }
    }

    /// RACK: marks every segment sent before the most recently delivered one,
    /// and older than one RACK RTT plus the reorder window, as lost.
    ///
    /// Returns the time until the next still-pending segment expires.
    pub fn update_lost_count(&mut self, params: &RackParams) -> Option<Duration> {
        let Some(rack_xmit) = self.rack_xmit_ts else {
            return None;
        };
        let reorder_window = if matches!(
            params.cong_state,
            TcpCongState::Recovery | TcpCongState::Loss
        ) || self.sacked_pkts >= 3
        {
            Duration::ZERO
        } else {
            let srtt_part = params.srtt / 8;
            match params.min_rtt {
                Some(min_rtt) => (min_rtt / 4).min(srtt_part),
                None => srtt_part,
            }
        };
        let deadline = self.rack_rtt + reorder_window;
        let mut pending: Option<Duration> = None;

        let walk: Vec<SegmentId> = self.tsorted.values().copied().collect();
        for id in walk {
            let segment = &self.arena[id];
            if segment.lost && !segment.retrans {
                continue;
            }
            let Some(last_sent) = segment.last_sent else {
                continue;
            };
            if (last_sent, segment.end_seq()) >= (rack_xmit, self.rack_end_seq) {
                break;
            }
            let elapsed = params.now.saturating_duration_since(last_sent);
            if elapsed >= deadline {
                let len = segment.len();
                let segment = &mut self.arena[id];
                if segment.lost {
                    // The retransmission itself was lost.
                    segment.retrans = false;
                    self.retrans_out -= len;
                } else {
                    segment.lost = true;
                    self.lost_out += len;
                }
                self.total_lost += len as u64;
                log::trace!(
                    "RACK marks {}..{} lost, elapsed {:?} rack_rtt {:?} reorder {:?}.",
                    segment.start_seq,
                    segment.end_seq(),
                    elapsed,
                    self.rack_rtt,
                    reorder_window
                );
                self.tsorted_remove(id);
            } else {
                let remaining = deadline - elapsed;
                pending = Some(pending.map_or(remaining, |p| p.max(remaining)));
            }
        }
        pending
    }

    /// True if the byte at `seq` is marked lost and nothing above the highest SACK can be.
    pub fn is_lost(&self, seq: SequenceNumber32) -> bool {
        if let Some(highest) = self.highest_sack {
            if seq >= highest {
                return false;
            }
        }
        match self.sent.range(..=seq).next_back() {
            Some((_, &id)) => {
                let segment = &self.arena[id];
                seq < segment.end_seq() && segment.lost
            }
            None => false,
        }
    }

    /// Next range to send, rfc6675 NextSeg() with RACK's lost marks.
    pub fn next_seg(
        &self,
        mss: u32,
        rwnd: u32,
        is_recovery: bool,
    ) -> Option<(SequenceNumber32, SequenceNumber32)> {
        // (1) lost and not yet retransmitted
        for &id in self.sent.values() {
            let segment = &self.arena[id];
            if segment.lost && !segment.retrans && !segment.sacked {
                return Some((segment.start_seq, segment.start_seq + mss));
            }
        }

        // (2) new data the peer window allows
        let sent_end = self.first_byte_seq + self.sent_size;
        if self.size_from_sequence(sent_end) > 0 {
            if self.sent_size < rwnd {
                return Some((sent_end, sent_end + mss.min(rwnd - self.sent_size)));
            }
            return None;
        }

        // (3) rescue retransmission of anything not yet sacked
        if is_recovery {
            let candidate = self
                .sent
                .values()
                .copied()
                .find(|&id| !self.arena[id].retrans && !self.arena[id].sacked);
            if let Some(id) = candidate {
                let segment = &self.arena[id];
                return Some((segment.start_seq, segment.start_seq + mss));
            }
        }
        None
    }

    /// rfc6675 pipe: sent - (sacked + lost) + retransmitted.
    pub fn bytes_in_flight(&self) -> u32 {
        let out = self.sent_size.saturating_sub(self.sacked_out + self.lost_out);
        out + self.retrans_out
    }

    /// Marks the scoreboard after an RTO. With `reset_sack` every SACK mark is forgotten too.
    pub fn set_sent_list_lost(&mut self, reset_sack: bool) {
        self.retrans_out = 0;
        if reset_sack {
            self.sacked_pkts = 0;
            self.sacked_out = 0;
            self.lost_out = self.sent_size;
            self.highest_sack = None;
        } else {
            self.lost_out = 0;
        }
        let ids: Vec<SegmentId> = self.sent.values().copied().collect();
        for id in ids {
            let segment = &mut self.arena[id];
            if reset_sack {
                if !segment.lost {
                    self.total_lost += segment.len() as u64;
                }
                segment.sacked = false;
                segment.lost = true;
            } else if segment.lost {
                self.lost_out += segment.len();
            } else if !segment.sacked {
                segment.lost = true;
                self.lost_out += segment.len();
                self.total_lost += segment.len() as u64;
            }
            segment.retrans = false;
            segment.rtt_unreliable = true;
            self.tsorted_remove(id);
        }
        self.consistency_check();
    }

    pub fn is_head_retransmitted(&self) -> bool {
        self.head_segment().is_some_and(|head| head.retrans)
    }

    pub fn mark_head_as_lost(&mut self) {
        let Some(&id) = self.sent.values().next() else {
            return;
        };
        let segment = &mut self.arena[id];
        let len = segment.len();
        if segment.sacked {
            segment.sacked = false;
            self.sacked_pkts -= 1;
            self.sacked_out -= len;
        }
        if segment.retrans {
            segment.retrans = false;
            self.retrans_out -= len;
        }
        if !segment.lost {
            segment.lost = true;
            self.lost_out += len;
            self.total_lost += len as u64;
        }
        segment.rtt_unreliable = true;
        self.tsorted_remove(id);
    }

    /// Emulates a SACK for the first unsacked segment after the head, for peers without SACK.
    pub fn add_reno_sack(&mut self) {
        debug_assert!(!self.sack_enabled);
        let candidate = self
            .sent
            .values()
            .skip(1)
            .copied()
            .find(|&id| !self.arena[id].sacked);
        if let Some(id) = candidate {
            let segment = &mut self.arena[id];
            segment.sacked = true;
            self.sacked_pkts += 1;
            self.sacked_out += segment.len();
            self.tsorted_remove(id);
        }
    }

    pub fn reset_reno_sack(&mut self) {
        self.sacked_out = 0;
        self.sacked_pkts = 0;
        for &id in self.sent.values() {
            self.arena[id].sacked = false;
        }
    }

    /// Start of the highest sacked segment.
    pub fn highest_sacked(&self) -> Option<SequenceNumber32> {
        self.highest_sack
    }

    fn consistency_check(&self) {
        if !cfg!(debug_assertions) {
            return;
        }
        let (mut sacked, mut lost, mut retrans, mut pkts, mut total) = (0, 0, 0, 0, 0);
        let mut expected = self.first_byte_seq;
        for (&start, &id) in &self.sent {
            let segment = &self.arena[id];
            debug_assert_eq!(start, segment.start_seq);
            debug_assert_eq!(start, expected, "hole in the sent list");
            expected = segment.end_seq();
            total += segment.len();
            if segment.sacked {
                sacked += segment.len();
                pkts += 1;
            }
            if segment.lost {
                lost += segment.len();
            }
            if segment.retrans {
                retrans += segment.len();
            }
        }
        debug_assert_eq!(total, self.sent_size);
        debug_assert_eq!(sacked, self.sacked_out);
        debug_assert_eq!(pkts, self.sacked_pkts);
        debug_assert_eq!(lost, self.lost_out);
        debug_assert_eq!(retrans, self.retrans_out);
        debug_assert_eq!(self.size, self.sent_size + self.app.len() as u32);
    }
}

#[cfg(test)]
mod tx_buffer_tests {
    use super::*;
    use rstest::rstest;

    const MSS: u32 = 1000;

    fn params(now: Instant, cong_state: TcpCongState) -> RackParams {
        RackParams {
            now,
            min_rtt: Some(Duration::from_millis(100)),
            srtt: Duration::from_millis(100),
            cong_state,
        }
    }

    fn seq(v: u32) -> SequenceNumber32 {
        SequenceNumber32::new(v)
    }

    fn buffer_with_sent(segments: u32, now: Instant) -> TxBuffer {
        let mut tx = TxBuffer::new(1 << 20, seq(0));
        assert!(tx.add(&vec![7u8; (segments * MSS) as usize]));
        for i in 0..segments {
            assert!(tx.copy_from_sequence(MSS, seq(i * MSS), now).is_some());
        }
        tx
    }

    #[test]
    fn test_tx_buffer_add_respects_capacity() {
        let mut tx = TxBuffer::new(100, seq(1));
        assert!(tx.add(&[]));
        assert!(tx.add(&[1; 60]));
        assert!(!tx.add(&[1; 41]));
        assert!(tx.add(&[1; 40]));
        assert_eq!(tx.available(), 0);
        assert_eq!(tx.tail_sequence(), seq(101));
    }

    #[rstest]
    #[case(0, 5000)]
    #[case(4999, 1)]
    #[case(5000, 0)]
    #[case(6000, 0)]
    fn test_tx_buffer_size_from_sequence(#[case] from: u32, #[case] expected: u32) {
        let mut tx = TxBuffer::new(1 << 16, seq(0));
        tx.add(&[0; 5000]);
        assert_eq!(tx.size_from_sequence(seq(from)), expected);
    }

    #[test]
    fn test_tx_buffer_new_segments_and_payload() {
        let now = Instant::now();
        let mut tx = TxBuffer::new(1 << 16, seq(10));
        let data: Vec<u8> = (0..=255).collect();
        tx.add(&data);
        let id = tx.copy_from_sequence(100, seq(10), now).unwrap();
        assert_eq!(tx.segment(id).payload, data[..100].to_vec());
        assert!(!tx.segment(id).retrans);
        let id = tx.copy_from_sequence(1000, seq(110), now).unwrap();
        assert_eq!(tx.segment(id).payload, data[100..].to_vec());
        assert_eq!(tx.sent_size(), 256);
        assert!(tx.copy_from_sequence(10, seq(266), now).is_none());
        assert_eq!(tx.bytes_in_flight(), 256);
    }

    #[test]
    fn test_tx_buffer_retransmit_split_and_merge() {
        let now = Instant::now();
        let mut tx = buffer_with_sent(3, now);
        // Middle of the first segment.
        let id = tx.copy_from_sequence(300, seq(200), now).unwrap();
        assert_eq!(tx.segment(id).start_seq, seq(200));
        assert_eq!(tx.segment(id).len(), 300);
        assert!(tx.segment(id).retrans);
        assert_eq!(tx.retrans_out(), 300);
        assert_eq!(tx.sent_segments().count(), 5);

        // Spanning two untouched segments merges them.
        let id = tx.copy_from_sequence(2000, seq(1000), now).unwrap();
        assert_eq!(tx.segment(id).len(), 2000);
        assert_eq!(tx.retrans_out(), 2300);
        assert_eq!(tx.total_retrans(), 2300);
        assert_eq!(tx.sent_segments().count(), 4);
    }

    #[test]
    fn test_tx_buffer_discard_partial_and_whole() {
        let now = Instant::now();
        let mut tx = buffer_with_sent(3, now);
        let p = params(now, TcpCongState::Open);
        let mut delivered = 0;
        tx.discard_up_to(seq(1500), &p, &mut |s| delivered += s.len());
        assert_eq!(delivered, 1000);
        assert_eq!(tx.head_sequence(), seq(1500));
        assert_eq!(tx.size(), 1500);
        assert_eq!(tx.head_segment().unwrap().start_seq, seq(1500));
        tx.discard_up_to(seq(3000), &p, &mut |s| delivered += s.len());
        assert_eq!(delivered, 2500);
        assert_eq!(tx.size(), 0);
        assert_eq!(tx.bytes_in_flight(), 0);
    }

    #[test]
    fn test_tx_buffer_discard_unsent_data() {
        let now = Instant::now();
        let mut tx = TxBuffer::new(1 << 16, seq(0));
        tx.add(&[0; 3000]);
        tx.discard_up_to(seq(2000), &params(now, TcpCongState::Open), &mut |_| {});
        assert_eq!(tx.head_sequence(), seq(2000));
        assert_eq!(tx.size(), 1000);
        assert_eq!(tx.sent_size(), 0);
    }

    #[test]
    fn test_tx_buffer_sack_skips_cached_blocks() {
        let now = Instant::now();
        let mut tx = buffer_with_sent(5, now);
        let later = now + Duration::from_millis(100);
        let p = params(later, TcpCongState::Open);
        let mut calls = 0;
        let sacked = tx.update(&[(seq(1000), seq(2000))], &p, &mut |_| calls += 1);
        assert_eq!(sacked, 1000);
        let sacked = tx.update(
            &[(seq(3000), seq(4000)), (seq(1000), seq(2000))],
            &p,
            &mut |_| calls += 1,
        );
        assert_eq!(sacked, 1000);
        assert_eq!(calls, 2);
        assert_eq!(tx.sacked_out(), 2000);
        assert_eq!(tx.sacked_packets(), 2);
        assert_eq!(tx.highest_sacked(), Some(seq(3000)));
    }

    // Ten segments in flight, the third and seventh are dropped and every
    // other one is sacked.
    #[test]
    fn test_tx_buffer_rack_marks_holes_lost() {
        let t0 = Instant::now();
        let mut tx = TxBuffer::new(1 << 20, seq(0));
        tx.add(&vec![0u8; 10 * MSS as usize]);
        for i in 0..10 {
            let sent_at = t0 + Duration::from_millis(i as u64);
            tx.copy_from_sequence(MSS, seq(i * MSS), sent_at).unwrap();
        }
        let now = t0 + Duration::from_millis(110);
        let p = params(now, TcpCongState::Open);
        tx.discard_up_to(seq(2 * MSS), &p, &mut |_| {});
        let blocks = [(seq(3 * MSS), seq(6 * MSS)), (seq(7 * MSS), seq(10 * MSS))];
        let sacked = tx.update(&blocks, &p, &mut |_| {});
        assert_eq!(sacked, 6 * MSS);
        assert!(tx.is_lost(seq(2 * MSS)));
        assert!(tx.is_lost(seq(6 * MSS)));
        assert!(!tx.is_lost(seq(4 * MSS)));
        assert_eq!(tx.lost_out(), 2 * MSS);
        assert_eq!(tx.bytes_in_flight(), 0);

        assert_eq!(tx.next_seg(MSS, 1 << 20, true), Some((seq(2 * MSS), seq(3 * MSS))));
        let id = tx.copy_from_sequence(MSS, seq(2 * MSS), now).unwrap();
        assert!(tx.segment(id).retrans);
        // Lost segments keep their timing for RACK.
        assert!(!tx.segment(id).rtt_unreliable);
        assert_eq!(tx.next_seg(MSS, 1 << 20, true), Some((seq(6 * MSS), seq(7 * MSS))));
        tx.copy_from_sequence(MSS, seq(6 * MSS), now).unwrap();
        assert_eq!(tx.bytes_in_flight(), 2 * MSS);
        assert_eq!(tx.next_seg(MSS, 1 << 20, true), None);

        let later = now + Duration::from_millis(100);
        tx.discard_up_to(seq(10 * MSS), &params(later, TcpCongState::Recovery), &mut |_| {});
        assert_eq!(tx.size(), 0);
        assert_eq!(tx.lost_out(), 0);
        assert_eq!(tx.retrans_out(), 0);
        assert_eq!(tx.sacked_out(), 0);
    }

    #[test]
    fn test_tx_buffer_rack_waits_for_reorder_window() {
        let t0 = Instant::now();
        let mut tx = TxBuffer::new(1 << 20, seq(0));
        tx.add(&vec![0u8; 3 * MSS as usize]);
        for i in 0..3 {
            tx.copy_from_sequence(MSS, seq(i * MSS), t0 + Duration::from_millis(i as u64 * 5))
                .unwrap();
        }
        let now = t0 + Duration::from_millis(110);
        // One sacked packet, so the reorder window is min(min_rtt/4, srtt/8).
        let sacked = tx.update(&[(seq(2 * MSS), seq(3 * MSS))], &params(now, TcpCongState::Open), &mut |_| {});
        assert_eq!(sacked, MSS);
        assert_eq!(tx.lost_out(), 0);
        let pending = tx.take_reorder_timeout().unwrap();
        assert!(pending > Duration::ZERO);

        let fire = now + pending;
        assert_eq!(tx.update_lost_count(&params(fire, TcpCongState::Open)), None);
        assert_eq!(tx.lost_out(), 2 * MSS);
    }

    #[test]
    fn test_tx_buffer_split_tail_stays_in_rack_order() {
        let t0 = Instant::now();
        let mut tx = TxBuffer::new(1 << 20, seq(0));
        tx.add(&vec![0u8; 3000]);
        tx.copy_from_sequence(2000, seq(0), t0).unwrap();
        tx.copy_from_sequence(1000, seq(2000), t0 + Duration::from_millis(1))
            .unwrap();
        // Resending the front half splits the first segment.
        tx.copy_from_sequence(1000, seq(0), t0).unwrap();

        let now = t0 + Duration::from_millis(200);
        tx.update(&[(seq(2000), seq(3000))], &params(now, TcpCongState::Open), &mut |_| {});
        let pending = tx.take_reorder_timeout().unwrap();
        tx.update_lost_count(&params(now + pending, TcpCongState::Open));
        assert!(tx.is_lost(seq(1000)));
    }

    #[test]
    fn test_tx_buffer_rto_marks_everything_lost() {
        let now = Instant::now();
        let mut tx = buffer_with_sent(4, now);
        let p = params(now + Duration::from_millis(50), TcpCongState::Open);
        tx.update(&[(seq(2000), seq(3000))], &p, &mut |_| {});
        tx.set_sent_list_lost(false);
        assert_eq!(tx.lost_out(), 3000);
        assert_eq!(tx.sacked_out(), 1000);
        assert_eq!(tx.bytes_in_flight(), 0);

        tx.set_sent_list_lost(true);
        assert_eq!(tx.lost_out(), 4000);
        assert_eq!(tx.sacked_out(), 0);
        assert_eq!(tx.highest_sacked(), None);
        assert_eq!(tx.next_seg(MSS, 1 << 20, false), Some((seq(0), seq(1000))));
    }

    #[test]
    fn test_tx_buffer_rescue_retransmission_marks_rtt_unreliable_when_sent() {
        let now = Instant::now();
        let mut tx = buffer_with_sent(2, now);
        // Picking the rescue candidate leaves the scoreboard alone.
        assert_eq!(tx.next_seg(MSS, 1 << 20, true), Some((seq(0), seq(1000))));
        assert_eq!(tx.next_seg(MSS, 1 << 20, true), Some((seq(0), seq(1000))));
        assert!(tx.sent_segments().all(|s| !s.rtt_unreliable && !s.retrans));

        let id = tx.copy_from_sequence(MSS, seq(0), now).unwrap();
        assert!(tx.segment(id).retrans);
        assert!(tx.segment(id).rtt_unreliable);
        assert_eq!(tx.next_seg(MSS, 1 << 20, true), Some((seq(1000), seq(2000))));
    }

    #[test]
    fn test_tx_buffer_next_seg_new_data_limited_by_rwnd() {
        let now = Instant::now();
        let mut tx = TxBuffer::new(1 << 16, seq(0));
        tx.add(&[0; 5000]);
        assert_eq!(tx.next_seg(MSS, 1500, false), Some((seq(0), seq(1000))));
        tx.copy_from_sequence(MSS, seq(0), now);
        assert_eq!(tx.next_seg(MSS, 1500, false), Some((seq(1000), seq(1500))));
        tx.copy_from_sequence(500, seq(1000), now);
        assert_eq!(tx.next_seg(MSS, 1500, false), None);
    }

    #[test]
    fn test_tx_buffer_reno_sack_and_head_lost() {
        let now = Instant::now();
        let mut tx = buffer_with_sent(3, now);
        tx.set_sack_enabled(false);
        tx.add_reno_sack();
        tx.mark_head_as_lost();
        assert_eq!(tx.sacked_out(), 1000);
        assert_eq!(tx.lost_out(), 1000);
        assert!(!tx.is_head_retransmitted());
        tx.copy_from_sequence(MSS, seq(0), now);
        assert!(tx.is_head_retransmitted());
        tx.reset_reno_sack();
        assert_eq!(tx.sacked_out(), 0);
        assert_eq!(tx.sacked_packets(), 0);
    }

    #[test]
    fn test_tx_buffer_peek_does_not_consume() {
        let now = Instant::now();
        let mut tx = TxBuffer::new(1 << 16, seq(0));
        let data: Vec<u8> = (0..50).collect();
        tx.add(&data);
        tx.copy_from_sequence(10, seq(0), now);
        tx.copy_from_sequence(10, seq(10), now);
        assert_eq!(tx.peek(seq(5), 20), data[5..25].to_vec());
        assert_eq!(tx.peek(seq(49), 5), vec![49]);
        assert_eq!(tx.sent_size(), 20);
    }

    fn assert_counters_match_segments(tx: &TxBuffer) {
        let (mut sacked, mut lost, mut retrans) = (0, 0, 0);
        for segment in tx.sent_segments() {
            if segment.sacked {
                sacked += segment.len();
            }
            if segment.lost {
                lost += segment.len();
            }
            if segment.retrans {
                retrans += segment.len();
            }
        }
        assert_eq!(tx.sacked_out(), sacked);
        assert_eq!(tx.lost_out(), lost);
        assert_eq!(tx.retrans_out(), retrans);
        assert!(tx.sent_size() >= sacked + lost);
    }

    #[test]
    fn test_tx_buffer_counters_follow_mixed_updates() {
        let t0 = Instant::now();
        let mut tx = buffer_with_sent(8, t0);
        let p = params(t0 + Duration::from_millis(10), TcpCongState::Open);

        tx.discard_up_to(seq(1000), &p, &mut |_| {});
        assert_counters_match_segments(&tx);
        tx.update(&[(seq(3000), seq(5000))], &p, &mut |_| {});
        assert_eq!(tx.sacked_out(), 2000);
        assert_counters_match_segments(&tx);
        tx.copy_from_sequence(MSS, seq(1000), p.now).unwrap();
        assert_counters_match_segments(&tx);

        tx.set_sent_list_lost(false);
        assert_eq!(tx.retrans_out(), 0);
        assert_counters_match_segments(&tx);
        tx.update(&[(seq(3000), seq(5000)), (seq(6000), seq(7000))], &p, &mut |_| {});
        assert_counters_match_segments(&tx);
        tx.copy_from_sequence(1500, seq(1000), p.now).unwrap();
        assert_counters_match_segments(&tx);
        // Partial ACK into a sacked segment.
        tx.discard_up_to(seq(3500), &p, &mut |_| {});
        assert_counters_match_segments(&tx);
        assert_eq!(tx.head_sequence(), seq(3500));
    }
}
