//! C2 — Direction State.
//!
//! A passive data container; all synchronization discipline is imposed by
//! the scheduler (C4), not by this module. Each gateway owns two of these,
//! one per `Direction`.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Instant;

/// Soft cap on queued entries before eldest-eviction kicks in (spec §3/§6).
pub const MAX_QUEUE_SIZE: usize = 10_000;

/// Latency ring buffer capacity (spec §3/§6).
pub const LATENCY_WINDOW_SIZE: usize = 100;

/// Which way a frame is crossing the gateway.
///
/// Modeled as a two-valued sum type per the redesign note against the
/// source's dynamic string identity; string aliases exist only at the
/// config/CLI edge (see `Direction::parse`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    ZeroToOne,
    OneToZero,
}

impl Direction {
    pub fn opposite(self) -> Direction {
        match self {
            Direction::ZeroToOne => Direction::OneToZero,
            Direction::OneToZero => Direction::ZeroToOne,
        }
    }

    /// BLF channel number: 1 for 0→1, 2 for 1→0 (spec §4.5/§6).
    pub fn channel(self) -> u8 {
        match self {
            Direction::ZeroToOne => 1,
            Direction::OneToZero => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::ZeroToOne => "0to1",
            Direction::OneToZero => "1to0",
        }
    }

    /// External-API alias parsing, for config files and rule definitions
    /// that also accept `"both"`.
    pub fn parse(s: &str) -> Option<RuleDirection> {
        match s {
            "0to1" => Some(RuleDirection::One(Direction::ZeroToOne)),
            "1to0" => Some(RuleDirection::One(Direction::OneToZero)),
            "both" => Some(RuleDirection::Both),
            _ => None,
        }
    }
}

/// A rule's direction filter can additionally match "both", unlike a
/// frame's own `Direction`, which is always exactly one of the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleDirection {
    One(Direction),
    Both,
}

impl RuleDirection {
    pub fn matches(self, d: Direction) -> bool {
        match self {
            RuleDirection::Both => true,
            RuleDirection::One(rd) => rd == d,
        }
    }
}

/// One entry waiting in a direction's time-ordered queue.
///
/// Ordered primarily by ascending `send_time`, ties broken by `recv_time`,
/// and a final monotonic `seq` guarantees strict FIFO among frames whose
/// `send_time` and `recv_time` are both equal (spec §4.4's tie-break note).
#[derive(Debug, Clone)]
pub struct QueuedEntry {
    pub send_time: Instant,
    pub recv_time: Instant,
    pub seq: u64,
    pub arbitration_id: u32,
    pub payload: Vec<u8>,
    pub is_extended_id: bool,
}

impl PartialEq for QueuedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.send_time == other.send_time && self.recv_time == other.recv_time && self.seq == other.seq
    }
}
impl Eq for QueuedEntry {}

impl Ord for QueuedEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; reverse the key order so the earliest
        // send_time (then earliest recv_time, then smallest seq) sorts to
        // the top, giving us a min-heap by peek()/pop().
        other
            .send_time
            .cmp(&self.send_time)
            .then_with(|| other.recv_time.cmp(&self.recv_time))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for QueuedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Min/max/mean/p95/p99 over a latency window, or "no samples".
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyStats {
    pub min_us: f64,
    pub max_us: f64,
    pub mean_us: f64,
    pub p95_us: f64,
    pub p99_us: f64,
}

/// The heap plus its condition variable — one logical sub-aggregate,
/// protected by a single lock per the concurrency model's "heap+condition
/// together" rule.
#[derive(Default)]
pub struct HeapState {
    pub heap: BinaryHeap<QueuedEntry>,
}

/// The three received/forwarded/dropped counters — the second
/// sub-aggregate, behind its own lock, separate from the heap lock.
#[derive(Default, Clone, Copy)]
pub struct Counters {
    pub received: u64,
    pub forwarded: u64,
    pub dropped: u64,
}

/// Per-direction container: counters, priority queue, latency window,
/// enable flag, wake primitive. All fields implementing the §5 lock table:
/// `heap` is guarded by `(heap_lock, condvar)`; `counters` has its own
/// lock; `latency_samples` has its own; `enabled` is a bare atomic (a
/// single bool satisfies "short critical section" without a distinct
/// Mutex).
pub struct DirectionState {
    pub direction: Direction,
    pub heap_lock: Mutex<HeapState>,
    pub condvar: Condvar,
    pub counters: Mutex<Counters>,
    pub latency_samples: Mutex<Vec<f64>>,
    pub enabled: AtomicBool,
    seq_counter: AtomicU64,
}

impl DirectionState {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            heap_lock: Mutex::new(HeapState::default()),
            condvar: Condvar::new(),
            counters: Mutex::new(Counters::default()),
            latency_samples: Mutex::new(Vec::with_capacity(LATENCY_WINDOW_SIZE)),
            enabled: AtomicBool::new(true),
            seq_counter: AtomicU64::new(0),
        }
    }

    /// Next insertion-order sequence number, used as the tie-break key.
    pub fn next_seq(&self) -> u64 {
        self.seq_counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Zeros all counters, empties the heap, clears the latency window.
    /// Called during `start`.
    pub fn reset_all(&self) {
        *self.counters.lock().unwrap() = Counters::default();
        self.heap_lock.lock().unwrap().heap.clear();
        self.latency_samples.lock().unwrap().clear();
        self.seq_counter.store(0, Ordering::Relaxed);
    }

    /// Snapshot count; not transactional with concurrent pop/push.
    pub fn queue_size(&self) -> usize {
        self.heap_lock.lock().unwrap().heap.len()
    }

    pub fn push_sample(&self, latency_us: f64) {
        let mut samples = self.latency_samples.lock().unwrap();
        if samples.len() >= LATENCY_WINDOW_SIZE {
            samples.remove(0);
        }
        samples.push(latency_us);
    }

    pub fn clear_latency_samples(&self) {
        self.latency_samples.lock().unwrap().clear();
    }

    pub fn latency_samples_snapshot(&self) -> Vec<f64> {
        self.latency_samples.lock().unwrap().clone()
    }

    /// min / max / mean / p95 / p99, nearest-rank on a sorted copy.
    pub fn latency_stats(&self) -> Option<LatencyStats> {
        let samples = self.latency_samples.lock().unwrap();
        if samples.is_empty() {
            return None;
        }
        let mut sorted = samples.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let n = sorted.len();
        let sum: f64 = sorted.iter().sum();
        Some(LatencyStats {
            min_us: sorted[0],
            max_us: sorted[n - 1],
            mean_us: sum / n as f64,
            p95_us: percentile(&sorted, 95),
            p99_us: percentile(&sorted, 99),
        })
    }
}

/// Nearest-rank percentile on an already-sorted slice.
fn percentile(sorted: &[f64], pct: usize) -> f64 {
    let n = sorted.len();
    let idx = (n * pct / 100).min(n - 1);
    sorted[idx]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_all_clears_everything() {
        let ds = DirectionState::new(Direction::ZeroToOne);
        ds.counters.lock().unwrap().received = 5;
        ds.push_sample(100.0);
        ds.heap_lock.lock().unwrap().heap.push(QueuedEntry {
            send_time: Instant::now(),
            recv_time: Instant::now(),
            seq: 0,
            arbitration_id: 1,
            payload: vec![],
            is_extended_id: false,
        });

        ds.reset_all();

        assert_eq!(ds.counters.lock().unwrap().received, 0);
        assert_eq!(ds.queue_size(), 0);
        assert!(ds.latency_stats().is_none());
    }

    #[test]
    fn latency_stats_none_when_empty() {
        let ds = DirectionState::new(Direction::ZeroToOne);
        assert!(ds.latency_stats().is_none());
    }

    #[test]
    fn latency_stats_nearest_rank_percentiles() {
        let ds = DirectionState::new(Direction::ZeroToOne);
        for i in 1..=100 {
            ds.push_sample(i as f64);
        }
        let stats = ds.latency_stats().unwrap();
        assert_eq!(stats.min_us, 1.0);
        assert_eq!(stats.max_us, 100.0);
        assert_eq!(stats.mean_us, 50.5);
        assert_eq!(stats.p95_us, 96.0);
        assert_eq!(stats.p99_us, 100.0);
    }

    #[test]
    fn latency_window_is_bounded() {
        let ds = DirectionState::new(Direction::ZeroToOne);
        for i in 0..(LATENCY_WINDOW_SIZE + 10) {
            ds.push_sample(i as f64);
        }
        assert_eq!(ds.latency_samples_snapshot().len(), LATENCY_WINDOW_SIZE);
    }

    #[test]
    fn heap_orders_by_send_time_then_recv_time_then_seq() {
        let mut heap = BinaryHeap::new();
        let base = Instant::now();
        heap.push(QueuedEntry {
            send_time: base + std::time::Duration::from_millis(10),
            recv_time: base,
            seq: 1,
            arbitration_id: 0xAAA,
            payload: vec![],
            is_extended_id: false,
        });
        heap.push(QueuedEntry {
            send_time: base + std::time::Duration::from_millis(5),
            recv_time: base,
            seq: 0,
            arbitration_id: 0xBBB,
            payload: vec![],
            is_extended_id: false,
        });
        let first = heap.pop().unwrap();
        assert_eq!(first.arbitration_id, 0xBBB);
    }

    #[test]
    fn rule_direction_both_matches_either() {
        assert!(RuleDirection::Both.matches(Direction::ZeroToOne));
        assert!(RuleDirection::Both.matches(Direction::OneToZero));
        assert!(RuleDirection::One(Direction::ZeroToOne).matches(Direction::ZeroToOne));
        assert!(!RuleDirection::One(Direction::ZeroToOne).matches(Direction::OneToZero));
    }
}
