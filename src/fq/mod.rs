//! Fair queue packet scheduler with earliest departure time pacing, after
//! Linux `sch_fq`.
//!
//! Packets are classified into flows by their owning socket. Flows with
//! traffic sit in either the `new` or the `old` round robin list and spend a
//! byte credit refilled by `quantum` each round. A flow whose head packet is
//! not due yet (its departure time, or the flow's own rate limit) is parked in
//! a time ordered throttled set until it matures.

pub mod flow;

use crate::config::FqConfig;
use flow::FqFlow;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::{Duration, Instant};
use thiserror::Error;

const FQ_GC_MAX: usize = 8;
const FQ_GC_AGE: Duration = Duration::from_millis(12);
const FQ_MAX_RATE_DELAY: Duration = Duration::from_secs(1);

/// What the scheduler needs to know about a queued packet.
pub trait FqItem {
    /// Bytes charged against the flow credit.
    fn size(&self) -> u32;
    /// Earliest departure time, `None` to send as soon as possible.
    fn tx_time(&self) -> Option<Instant>;
    fn set_tx_time(&mut self, at: Instant);
    /// Stable key of the sending socket, `None` for packets without one.
    fn flow_key(&self) -> Option<u64>;
    /// Used to spread socketless packets, normally a hash of the 4-tuple.
    fn flow_hash(&self) -> u64;
    /// Sets CE, returns false when the packet is not ECN capable.
    fn mark_ce(&mut self) -> bool;
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FqDropReason {
    #[error("queue limit exceeded")]
    QueueLimit,
    #[error("flow packet limit exceeded")]
    FlowLimit,
    #[error("departure time beyond horizon")]
    Horizon,
}

/// A rejected packet handed back to the caller.
#[derive(Debug)]
pub struct FqDrop<T> {
    pub reason: FqDropReason,
    pub item: T,
}

#[derive(Debug, PartialEq, Eq)]
pub enum FqDequeue<T> {
    Ready(T),
    /// Nothing is due; call again at this time.
    Throttled(Instant),
    Empty,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FqStats {
    pub enqueued: u64,
    pub dequeued: u64,
    pub dropped_queue_limit: u64,
    pub dropped_flow_limit: u64,
    pub dropped_horizon: u64,
    pub horizon_capped: u64,
    pub ce_marked: u64,
    pub throttled: u64,
    pub gc_flows: u64,
}

#[derive(Debug)]
pub struct FqScheduler<T> {
    config: FqConfig,
    roots: Vec<BTreeMap<u64, FqFlow<T>>>,
    new_flows: VecDeque<u64>,
    old_flows: VecDeque<u64>,
    delayed: BTreeSet<(Instant, u64)>,
    time_next_delayed: Option<Instant>,
    qlen: u32,
    flows: u32,
    inactive_flows: u32,
    stats: FqStats,
}

// Multiplicative hash of linux/hash.h.
fn hash_key(key: u64, bits: u32) -> usize {
    if bits == 0 {
        return 0;
    }
    (key.wrapping_mul(0x61C8_8646_80B5_83EB) >> (64 - bits.min(63))) as usize
}

impl<T: FqItem> FqScheduler<T> {
    pub fn new(config: FqConfig) -> Self {
        let buckets = 1usize << config.buckets_log.min(20);
        Self {
            config,
            roots: (0..buckets).map(|_| BTreeMap::new()).collect(),
            new_flows: VecDeque::new(),
            old_flows: VecDeque::new(),
            delayed: BTreeSet::new(),
            time_next_delayed: None,
            qlen: 0,
            flows: 0,
            inactive_flows: 0,
            stats: FqStats::default(),
        }
    }

    pub fn len(&self) -> u32 {
        self.qlen
    }

    pub fn is_empty(&self) -> bool {
        self.qlen == 0
    }

    pub fn flow_count(&self) -> u32 {
        self.flows
    }

    pub fn stats(&self) -> &FqStats {
        &self.stats
    }

    pub fn flow(&self, key: u64) -> Option<&FqFlow<T>> {
        let root = hash_key(key, self.config.buckets_log);
        self.roots.get(root)?.get(&key)
    }

    fn classify(&mut self, item: &T, now: Instant) -> u64 {
        let key = match item.flow_key() {
            Some(socket) => socket << 1,
            None => (item.flow_hash() << 1) | 1,
        };
        let root = hash_key(key, self.config.buckets_log);
        if self.flows >= 2 * self.roots.len() as u32 && self.inactive_flows > self.flows / 2 {
            self.garbage_collection(root, key, now);
        }
        if !self.roots[root].contains_key(&key) {
            let flow = FqFlow::new(key, self.config.initial_quantum as i64, now);
            self.roots[root].insert(key, flow);
            self.flows += 1;
            self.inactive_flows += 1;
            log::trace!("FQ new flow key={:#x} (flows={}).", key, self.flows);
        }
        key
    }

    // Frees detached flows that stayed idle long enough, stopping at the flow
    // being classified.
    fn garbage_collection(&mut self, root: usize, key: u64, now: Instant) {
        let to_free: Vec<u64> = self.roots[root]
            .values()
            .take_while(|flow| flow.key != key)
            .filter(|flow| flow.detached && now > flow.age + FQ_GC_AGE)
            .map(|flow| flow.key)
            .take(FQ_GC_MAX)
            .collect();
        for freed in &to_free {
            self.roots[root].remove(freed);
        }
        let count = to_free.len() as u32;
        self.flows -= count;
        self.inactive_flows -= count;
        self.stats.gc_flows += count as u64;
        if count > 0 {
            log::debug!("FQ garbage collected {} idle flow(s).", count);
        }
    }

    pub fn enqueue(&mut self, mut item: T, now: Instant) -> Result<(), FqDrop<T>> {
        if self.qlen >= self.config.limit {
            return Err(self.drop_item(item, FqDropReason::QueueLimit));
        }
        match item.tx_time() {
            None => item.set_tx_time(now),
            Some(at) if at > now + self.config.horizon => {
                if self.config.horizon_drop {
                    return Err(self.drop_item(item, FqDropReason::Horizon));
                }
                self.stats.horizon_capped += 1;
                item.set_tx_time(now + self.config.horizon);
            }
            Some(_) => {}
        }

        let key = self.classify(&item, now);
        let root = hash_key(key, self.config.buckets_log);
        let Some(flow) = self.roots[root].get_mut(&key) else {
            return Err(self.drop_item(item, FqDropReason::QueueLimit));
        };
        if flow.qlen >= self.config.flow_limit {
            return Err(self.drop_item(item, FqDropReason::FlowLimit));
        }
        flow.qlen += 1;
        if flow.detached {
            self.new_flows.push_back(key);
            flow.detached = false;
            if now > flow.age + self.config.flow_refill_delay {
                flow.credit = flow.credit.max(self.config.quantum as i64);
            }
            self.inactive_flows -= 1;
        }
        flow.add(item);
        self.qlen += 1;
        self.stats.enqueued += 1;
        Ok(())
    }

    fn drop_item(&mut self, item: T, reason: FqDropReason) -> FqDrop<T> {
        match reason {
            FqDropReason::QueueLimit => self.stats.dropped_queue_limit += 1,
            FqDropReason::FlowLimit => self.stats.dropped_flow_limit += 1,
            FqDropReason::Horizon => self.stats.dropped_horizon += 1,
        }
        log::debug!(
            "FQ dropped a packet of {} bytes: {}. (qlen={})",
            item.size(),
            reason,
            self.qlen
        );
        FqDrop { reason, item }
    }

    fn check_throttled(&mut self, now: Instant) {
        match self.time_next_delayed {
            Some(at) if at <= now => {}
            _ => return,
        }
        self.time_next_delayed = None;
        while let Some(&(at, key)) = self.delayed.first() {
            if at > now {
                self.time_next_delayed = Some(at);
                break;
            }
            self.delayed.pop_first();
            self.old_flows.push_back(key);
        }
    }

    pub fn dequeue(&mut self, now: Instant) -> FqDequeue<T> {
        if self.qlen == 0 {
            return FqDequeue::Empty;
        }
        self.check_throttled(now);

        loop {
            let from_new = !self.new_flows.is_empty();
            let front = if from_new {
                self.new_flows.front()
            } else {
                self.old_flows.front()
            };
            let Some(&key) = front else {
                return match self.time_next_delayed {
                    Some(at) => FqDequeue::Throttled(at),
                    None => FqDequeue::Empty,
                };
            };
            let list = if from_new {
                &mut self.new_flows
            } else {
                &mut self.old_flows
            };
            let root = hash_key(key, self.config.buckets_log);
            let Some(flow) = self.roots[root].get_mut(&key) else {
                list.pop_front();
                continue;
            };

            if flow.credit <= 0 {
                flow.credit += self.config.quantum as i64;
                list.pop_front();
                self.old_flows.push_back(key);
                continue;
            }

            let Some(head_time) = flow.peek().map(|head| head.tx_time().unwrap_or(now)) else {
                list.pop_front();
                if from_new && !self.old_flows.is_empty() {
                    self.old_flows.push_back(key);
                } else {
                    flow.detached = true;
                    flow.age = now;
                    self.inactive_flows += 1;
                }
                continue;
            };

            let due = match flow.time_next_packet {
                Some(next) => head_time.max(next),
                None => head_time,
            };
            if now < due {
                list.pop_front();
                flow.time_next_packet = Some(due);
                self.delayed.insert((due, key));
                self.stats.throttled += 1;
                self.time_next_delayed = Some(self.time_next_delayed.map_or(due, |t| t.min(due)));
                continue;
            }

            let Some(mut item) = flow.pop_head() else {
                continue;
            };
            if let Some(threshold) = self.config.ce_threshold {
                if now.saturating_duration_since(due) > threshold && item.mark_ce() {
                    self.stats.ce_marked += 1;
                    log::trace!("FQ CE marked a packet of flow key={:#x}.", key);
                }
            }
            flow.qlen -= 1;
            self.qlen -= 1;
            self.stats.dequeued += 1;
            flow.credit -= item.size() as i64;

            if self.config.rate_enable {
                if let Some(rate) = self.config.flow_max_rate.filter(|&r| r > 0) {
                    let mut delay =
                        Duration::from_nanos(item.size() as u64 * 1_000_000_000 / rate)
                            .min(FQ_MAX_RATE_DELAY);
                    if let Some(next) = flow.time_next_packet {
                        delay -= (delay / 2).min(now.saturating_duration_since(next));
                    }
                    flow.time_next_packet = Some(now + delay);
                }
            }
            return FqDequeue::Ready(item);
        }
    }
}

#[cfg(test)]
pub(crate) mod fq_tests {
    use super::*;
    use rstest::rstest;

    #[derive(Debug, PartialEq, Eq)]
    pub(crate) struct TestItem {
        pub id: u32,
        pub key: u64,
        pub size: u32,
        pub tx_time: Option<Instant>,
        pub ect: bool,
        pub ce: bool,
    }

    impl TestItem {
        pub fn new(id: u32, key: u64, size: u32) -> Self {
            Self {
                id,
                key,
                size,
                tx_time: None,
                ect: true,
                ce: false,
            }
        }

        pub fn at(id: u32, size: u32, tx_time: Instant) -> Self {
            Self {
                tx_time: Some(tx_time),
                ..Self::new(id, 1, size)
            }
        }
    }

    impl FqItem for TestItem {
        fn size(&self) -> u32 {
            self.size
        }

        fn tx_time(&self) -> Option<Instant> {
            self.tx_time
        }

        fn set_tx_time(&mut self, at: Instant) {
            self.tx_time = Some(at);
        }

        fn flow_key(&self) -> Option<u64> {
            Some(self.key)
        }

        fn flow_hash(&self) -> u64 {
            self.key
        }

        fn mark_ce(&mut self) -> bool {
            if self.ect {
                self.ce = true;
            }
            self.ect
        }
    }

    fn ready_id(fq: &mut FqScheduler<TestItem>, now: Instant) -> Option<u32> {
        match fq.dequeue(now) {
            FqDequeue::Ready(item) => Some(item.id),
            _ => None,
        }
    }

    #[test]
    fn test_fq_round_robin_by_quantum() {
        let t0 = Instant::now();
        let mut fq = FqScheduler::new(FqConfig {
            quantum: 1000,
            initial_quantum: 1000,
            ..Default::default()
        });
        for i in 0..3 {
            fq.enqueue(TestItem::new(10 + i, 1, 1000), t0).unwrap();
            fq.enqueue(TestItem::new(20 + i, 2, 1000), t0).unwrap();
        }
        assert_eq!(fq.flow_count(), 2);
        let order: Vec<u32> = std::iter::from_fn(|| ready_id(&mut fq, t0)).collect();
        assert_eq!(order, vec![10, 20, 11, 21, 12, 22]);
        assert_eq!(fq.dequeue(t0), FqDequeue::Empty);
        assert_eq!(fq.stats().dequeued, 6);
    }

    #[test]
    fn test_fq_honors_departure_time() {
        let t0 = Instant::now();
        let due = t0 + Duration::from_millis(5);
        let mut fq = FqScheduler::new(FqConfig::default());
        fq.enqueue(TestItem::at(1, 1500, due), t0).unwrap();
        assert_eq!(fq.dequeue(t0), FqDequeue::Throttled(due));
        assert_eq!(fq.dequeue(t0 + Duration::from_millis(4)), FqDequeue::Throttled(due));
        assert_eq!(ready_id(&mut fq, due), Some(1));
        assert_eq!(fq.stats().throttled, 1);
    }

    #[rstest]
    #[case(true, Err(FqDropReason::Horizon))]
    #[case(false, Ok(()))]
    fn test_fq_horizon(#[case] horizon_drop: bool, #[case] expected: Result<(), FqDropReason>) {
        let t0 = Instant::now();
        let mut fq = FqScheduler::new(FqConfig {
            horizon_drop,
            ..Default::default()
        });
        let result = fq
            .enqueue(TestItem::at(1, 100, t0 + Duration::from_secs(11)), t0)
            .map_err(|drop| drop.reason);
        assert_eq!(result, expected);
        if !horizon_drop {
            let capped = t0 + Duration::from_secs(10);
            assert_eq!(fq.dequeue(t0), FqDequeue::Throttled(capped));
            assert_eq!(fq.stats().horizon_capped, 1);
        }
    }

    #[test]
    fn test_fq_limits() {
        let t0 = Instant::now();
        let mut fq = FqScheduler::new(FqConfig {
            limit: 3,
            flow_limit: 2,
            ..Default::default()
        });
        fq.enqueue(TestItem::new(1, 1, 100), t0).unwrap();
        fq.enqueue(TestItem::new(2, 1, 100), t0).unwrap();
        let drop = fq.enqueue(TestItem::new(3, 1, 100), t0).unwrap_err();
        assert_eq!(drop.reason, FqDropReason::FlowLimit);
        assert_eq!(drop.item.id, 3);
        fq.enqueue(TestItem::new(4, 2, 100), t0).unwrap();
        let drop = fq.enqueue(TestItem::new(5, 2, 100), t0).unwrap_err();
        assert_eq!(drop.reason, FqDropReason::QueueLimit);
        assert_eq!(fq.len(), 3);
        assert_eq!(fq.flow(1 << 1).map(|f| f.qlen()), Some(2));
    }

    #[test]
    fn test_fq_flow_max_rate() {
        let t0 = Instant::now();
        let mut fq = FqScheduler::new(FqConfig {
            flow_max_rate: Some(1_000_000),
            ..Default::default()
        });
        fq.enqueue(TestItem::new(1, 1, 1000), t0).unwrap();
        fq.enqueue(TestItem::new(2, 1, 1000), t0).unwrap();
        assert_eq!(ready_id(&mut fq, t0), Some(1));
        let next = t0 + Duration::from_millis(1);
        assert_eq!(fq.dequeue(t0), FqDequeue::Throttled(next));
        assert_eq!(ready_id(&mut fq, next), Some(2));
    }

    #[rstest]
    #[case(true, true, 1)]
    #[case(false, false, 0)]
    fn test_fq_ce_threshold(#[case] ect: bool, #[case] marked: bool, #[case] count: u64) {
        let t0 = Instant::now();
        let mut fq = FqScheduler::new(FqConfig {
            ce_threshold: Some(Duration::from_millis(1)),
            ..Default::default()
        });
        let mut item = TestItem::new(1, 1, 1000);
        item.ect = ect;
        fq.enqueue(item, t0).unwrap();
        match fq.dequeue(t0 + Duration::from_millis(2)) {
            FqDequeue::Ready(item) => assert_eq!(item.ce, marked),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(fq.stats().ce_marked, count);
    }

    #[test]
    fn test_fq_hash_key_range() {
        for key in [0u64, 1, 2, 0xdead_beef, u64::MAX] {
            assert!(hash_key(key, 10) < 1024);
            assert_eq!(hash_key(key, 0), 0);
        }
    }
}
