use super::FqItem;
use std::collections::{BTreeMap, VecDeque};
use std::time::Instant;

/// Per socket queue of the fair-queue scheduler.
///
/// Items normally arrive with non-decreasing departure times and go to a
/// plain FIFO. An item that would depart earlier than the FIFO tail is kept
/// aside, ordered by departure time, and `peek` returns whichever head leaves
/// first.
#[derive(Debug)]
pub struct FqFlow<T> {
    pub(super) key: u64,
    items: VecDeque<T>,
    out_of_order: BTreeMap<(Instant, u64), T>,
    out_of_order_counter: u64,
    /// Not linked into the new or old list.
    pub(super) detached: bool,
    /// When the flow was created or last became detached.
    pub(super) age: Instant,
    pub(super) qlen: u32,
    pub(super) credit: i64,
    pub(super) time_next_packet: Option<Instant>,
}

impl<T: FqItem> FqFlow<T> {
    pub fn new(key: u64, credit: i64, now: Instant) -> Self {
        Self {
            key,
            items: VecDeque::new(),
            out_of_order: BTreeMap::new(),
            out_of_order_counter: 0,
            detached: true,
            age: now,
            qlen: 0,
            credit,
            time_next_packet: None,
        }
    }

    pub fn add(&mut self, item: T) {
        let tx_time = item.tx_time().unwrap_or_else(|| {
            // Enqueue always stamps a departure time first.
            self.items.back().and_then(|i| i.tx_time()).unwrap_or(self.age)
        });
        let in_order = match self.items.back() {
            None => true,
            Some(tail) => tail.tx_time().map_or(true, |tail_time| tx_time >= tail_time),
        };
        if in_order {
            self.items.push_back(item);
        } else {
            self.out_of_order
                .insert((tx_time, self.out_of_order_counter), item);
            self.out_of_order_counter += 1;
        }
    }

    fn head_is_fifo(&self) -> Option<bool> {
        match (self.items.front(), self.out_of_order.first_key_value()) {
            (None, None) => None,
            (Some(_), None) => Some(true),
            (None, Some(_)) => Some(false),
            (Some(fifo), Some(((aside, _), _))) => {
                Some(fifo.tx_time().map_or(true, |fifo_time| fifo_time < *aside))
            }
        }
    }

    pub fn peek(&self) -> Option<&T> {
        match self.head_is_fifo()? {
            true => self.items.front(),
            false => self.out_of_order.first_key_value().map(|(_, item)| item),
        }
    }

    pub fn peek_mut(&mut self) -> Option<&mut T> {
        match self.head_is_fifo()? {
            true => self.items.front_mut(),
            false => self.out_of_order.values_mut().next(),
        }
    }

    pub fn pop_head(&mut self) -> Option<T> {
        match self.head_is_fifo()? {
            true => self.items.pop_front(),
            false => self.out_of_order.pop_first().map(|(_, item)| item),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.out_of_order.is_empty()
    }

    pub fn qlen(&self) -> u32 {
        self.qlen
    }

    pub fn credit(&self) -> i64 {
        self.credit
    }
}

#[cfg(test)]
mod flow_tests {
    use super::*;
    use crate::fq::fq_tests::TestItem;
    use std::time::Duration;

    #[test]
    fn test_flow_out_of_order_item_leaves_first() {
        let t0 = Instant::now();
        let mut flow = FqFlow::new(1, 0, t0);
        flow.add(TestItem::at(1, 100, t0 + Duration::from_millis(5)));
        flow.add(TestItem::at(2, 100, t0 + Duration::from_millis(10)));
        flow.add(TestItem::at(3, 100, t0 + Duration::from_millis(1)));
        let order: Vec<u32> = std::iter::from_fn(|| flow.pop_head().map(|i| i.id)).collect();
        assert_eq!(order, vec![3, 1, 2]);
        assert!(flow.is_empty());
    }

    #[test]
    fn test_flow_equal_times_keep_fifo_order() {
        let t0 = Instant::now();
        let mut flow = FqFlow::new(1, 0, t0);
        for id in 0..4 {
            flow.add(TestItem::at(id, 100, t0));
        }
        assert_eq!(flow.peek().map(|i| i.id), Some(0));
        let order: Vec<u32> = std::iter::from_fn(|| flow.pop_head().map(|i| i.id)).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
    }
}
