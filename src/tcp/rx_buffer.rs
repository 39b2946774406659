use super::packet::{SackBlock, TCP_SACK_MAX_BLOCKS};
use super::seq::SequenceNumber32;
use std::collections::BTreeMap;

/// Reassembly buffer for the receive side.
///
/// Segments are stored by their first sequence number with overlaps trimmed
/// on insertion, so stored ranges never intersect. `next_rx_seq` is the first
/// byte not yet received in order; `avail_bytes` of in-order data wait for the
/// application.
#[derive(Debug)]
pub struct RxBuffer {
    data: BTreeMap<SequenceNumber32, Vec<u8>>,
    next_rx_seq: SequenceNumber32,
    max_buffer: u32,
    size: u32,
    avail_bytes: u32,
    got_fin: bool,
    fin_seq: SequenceNumber32,
    // Most recently changed block first.
    sack_list: Vec<SackBlock>,
}

impl RxBuffer {
    pub fn new(max_buffer: u32, next_rx_seq: SequenceNumber32) -> Self {
        Self {
            data: BTreeMap::new(),
            next_rx_seq,
            max_buffer,
            size: 0,
            avail_bytes: 0,
            got_fin: false,
            fin_seq: SequenceNumber32::default(),
            sack_list: Vec::new(),
        }
    }

    pub fn next_rx_sequence(&self) -> SequenceNumber32 {
        self.next_rx_seq
    }

    pub fn set_next_rx_sequence(&mut self, seq: SequenceNumber32) {
        self.next_rx_seq = seq;
    }

    /// Consumes the sequence number of a SYN.
    pub fn inc_next_rx_sequence(&mut self) {
        debug_assert_eq!(self.size, 0);
        self.next_rx_seq += 1;
    }

    pub fn max_buffer_size(&self) -> u32 {
        self.max_buffer
    }

    pub fn set_max_buffer_size(&mut self, max: u32) {
        self.max_buffer = max;
    }

    /// Buffered bytes, in order or not.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// In-order bytes ready for the application.
    pub fn available(&self) -> u32 {
        self.avail_bytes
    }

    pub fn got_fin(&self) -> bool {
        self.got_fin
    }

    /// One past the highest sequence number the buffer accepts.
    pub fn max_rx_sequence(&self) -> SequenceNumber32 {
        if self.got_fin {
            return self.fin_seq;
        }
        if let Some((&first, _)) = self.data.iter().next() {
            if self.next_rx_seq > first {
                return first + self.max_buffer;
            }
        }
        self.next_rx_seq + self.max_buffer
    }

    pub fn set_fin_sequence(&mut self, seq: SequenceNumber32) {
        self.got_fin = true;
        self.fin_seq = seq;
        if self.next_rx_seq == self.fin_seq {
            self.next_rx_seq += 1;
        }
    }

    /// All data up to and including the FIN has been received.
    pub fn finished(&self) -> bool {
        self.got_fin && self.fin_seq < self.next_rx_seq
    }

    pub fn sack_list(&self) -> &[SackBlock] {
        &self.sack_list
    }

    /// Inserts the bytes of a segment starting at `seq`. Returns false when
    /// nothing new could be stored: a pure duplicate, or entirely outside the window.
    pub fn add(&mut self, seq: SequenceNumber32, payload: &[u8]) -> bool {
        let mut head = seq;
        let mut tail = seq + payload.len() as u32;
        if head < self.next_rx_seq {
            head = self.next_rx_seq;
        }
        let max_seq = match self.data.iter().next() {
            Some((&first, _)) => first + self.max_buffer,
            None => self.next_rx_seq + self.max_buffer,
        };
        if max_seq < tail {
            tail = max_seq;
        }
        if tail < head {
            head = tail;
        }

        // Walk stored segments below the tail, highest first, trimming the
        // new range against them and dropping those it fully covers.
        let below_tail: Vec<(SequenceNumber32, u32)> = self
            .data
            .range(..tail)
            .rev()
            .map(|(&k, v)| (k, v.len() as u32))
            .collect();
        for (start, len) in below_tail {
            let last = start + len;
            if last <= head {
                break;
            }
            if start > head && last < tail {
                self.size -= len;
                self.data.remove(&start);
                continue;
            }
            if start <= head {
                head = last;
            }
            if last >= tail {
                tail = start;
            }
        }
        if head >= tail {
            log::trace!(
                "RxBuffer has nothing new in {}..{} (next_rx={}).",
                seq,
                seq + payload.len() as u32,
                self.next_rx_seq
            );
            return false;
        }

        let from = (head - seq) as usize;
        let to = from + (tail - head) as usize;
        debug_assert!(!self.data.contains_key(&head));
        debug_assert!(tail.in_window(self.next_rx_seq));
        self.data.insert(head, payload[from..to].to_vec());
        if head > self.next_rx_seq {
            self.update_sack_list(head, tail);
        }
        self.size += (tail - head) as u32;

        for (&start, bytes) in self.data.range(self.next_rx_seq..) {
            if start > self.next_rx_seq {
                break;
            }
            self.next_rx_seq = start + bytes.len() as u32;
            self.avail_bytes += bytes.len() as u32;
        }
        self.clear_sack_list(self.next_rx_seq);
        if self.got_fin && self.next_rx_seq == self.fin_seq {
            self.next_rx_seq += 1;
        }
        true
    }

    // rfc2018 section 4: the block holding the most recent segment goes first.
    fn update_sack_list(&mut self, start: SequenceNumber32, end: SequenceNumber32) {
        debug_assert!(start > self.next_rx_seq);
        if let Some(i) = self
            .sack_list
            .iter()
            .position(|&(s, e)| start <= e && s <= end)
        {
            let (s, e) = self.sack_list.remove(i);
            let mut merged = (s.min(start), e.max(end));
            // The grown block may now touch others.
            self.sack_list.retain(|&(s, e)| {
                if s <= merged.1 && merged.0 <= e {
                    merged = (merged.0.min(s), merged.1.max(e));
                    false
                } else {
                    true
                }
            });
            self.sack_list.insert(0, merged);
            return;
        }
        if self.sack_list.len() >= TCP_SACK_MAX_BLOCKS {
            self.sack_list.pop();
        }
        self.sack_list.insert(0, (start, end));
    }

    fn clear_sack_list(&mut self, seq: SequenceNumber32) {
        self.sack_list.retain(|&(_, end)| end > seq);
    }

    /// Removes up to `max_size` in-order bytes.
    pub fn extract(&mut self, max_size: u32) -> Option<Vec<u8>> {
        let mut extract_size = max_size.min(self.avail_bytes);
        if extract_size == 0 {
            return None;
        }
        let mut out = Vec::with_capacity(extract_size as usize);
        while extract_size > 0 {
            let Some((start, mut bytes)) = self.data.pop_first() else {
                break;
            };
            debug_assert!(start <= self.next_rx_seq);
            let len = bytes.len() as u32;
            if len <= extract_size {
                out.append(&mut bytes);
                self.size -= len;
                self.avail_bytes -= len;
                extract_size -= len;
            } else {
                let rest = bytes.split_off(extract_size as usize);
                out.append(&mut bytes);
                self.data.insert(start + extract_size, rest);
                self.size -= extract_size;
                self.avail_bytes -= extract_size;
                extract_size = 0;
            }
        }
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }
}
