//! C4 — Gateway Scheduler.
//!
//! The keystone: four long-lived threads per gateway — two receivers, two
//! senders — coordinated through two `DirectionState`s. Grounded directly
//! on the original `BidirectionalGateway._receive_loop`/`_send_loop`
//! pseudocode and its three-lock discipline (heap+condition, counters,
//! latency), reimplemented with native `std::thread`/`Mutex`/`Condvar`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, warn};

use crate::capture::CaptureSession;
use crate::direction::{Direction, DirectionState, QueuedEntry, MAX_QUEUE_SIZE};
use crate::error::GatewayError;
use crate::frame::Frame;
use crate::link::{CanLink, CanLinkFactory};
use crate::manipulation::{Action, ManipulationEngine};

/// Bounded poll timeout on the receive path (spec §5/§6).
pub const RECV_POLL_TIMEOUT: Duration = Duration::from_millis(100);
/// Idle wait on the sender's condition when its queue is empty (spec §6).
pub const SENDER_IDLE_WAIT: Duration = Duration::from_millis(500);
/// Minimum bound the scheduler honors when joining worker threads at stop.
pub const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    Running,
    Stopping,
}

/// `delay_ms` / `jitter_ms` / `loss_pct`, read as one consistent snapshot
/// per frame (spec I4: "parameter mutations observed by the receive path
/// are atomic with respect to the per-frame send_time computation"). A
/// single short-held `Mutex` around all three values is simpler to reason
/// about than three independent atomics and still satisfies "at most one
/// lock at a time" — this lock is never nested with the heap/stats/
/// latency/direction-enable locks.
#[derive(Debug, Clone, Copy, Default)]
pub struct SettingsValues {
    pub delay_ms: f32,
    pub jitter_ms: f32,
    pub loss_pct: f32,
}

#[derive(Default)]
pub struct Settings {
    values: Mutex<SettingsValues>,
}

impl Settings {
    pub fn snapshot(&self) -> SettingsValues {
        *self.values.lock().unwrap()
    }

    /// Partial update; `None` fields are left unchanged. `jitter_ms`
    /// below zero is clamped to zero per spec §4.6/§7. Returns the
    /// resulting full snapshot so the caller can build a `SETTINGS_CHANGED`
    /// event from only the fields that actually changed.
    pub fn update(&self, delay_ms: Option<f32>, jitter_ms: Option<f32>, loss_pct: Option<f32>) -> SettingsValues {
        let mut v = self.values.lock().unwrap();
        if let Some(d) = delay_ms {
            v.delay_ms = d;
        }
        if let Some(j) = jitter_ms {
            v.jitter_ms = j.max(0.0);
        }
        if let Some(l) = loss_pct {
            v.loss_pct = l;
        }
        *v
    }
}

/// Everything C4 needs to run one bidirectional gateway. Owned by the
/// facade (C6), which is the only thing callers construct directly.
pub struct GatewayCore {
    iface0: String,
    iface1: String,
    factory: Arc<dyn CanLinkFactory>,
    state: Mutex<RunState>,
    running: Arc<AtomicBool>,
    pub dir_0to1: Arc<DirectionState>,
    pub dir_1to0: Arc<DirectionState>,
    pub manipulation: Arc<ManipulationEngine>,
    pub settings: Arc<Settings>,
    pub capture: Arc<RwLock<Option<Arc<CaptureSession>>>>,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
    handle0: Mutex<Option<Arc<dyn CanLink>>>,
    handle1: Mutex<Option<Arc<dyn CanLink>>>,
}

impl GatewayCore {
    pub fn new(iface0: impl Into<String>, iface1: impl Into<String>, factory: Arc<dyn CanLinkFactory>) -> Self {
        Self {
            iface0: iface0.into(),
            iface1: iface1.into(),
            factory,
            state: Mutex::new(RunState::Idle),
            running: Arc::new(AtomicBool::new(false)),
            dir_0to1: Arc::new(DirectionState::new(Direction::ZeroToOne)),
            dir_1to0: Arc::new(DirectionState::new(Direction::OneToZero)),
            manipulation: Arc::new(ManipulationEngine::new()),
            settings: Arc::new(Settings::default()),
            capture: Arc::new(RwLock::new(None)),
            threads: Mutex::new(Vec::new()),
            handle0: Mutex::new(None),
            handle1: Mutex::new(None),
        }
    }

    pub fn iface0(&self) -> &str {
        &self.iface0
    }

    pub fn iface1(&self) -> &str {
        &self.iface1
    }

    pub fn is_running(&self) -> bool {
        *self.state.lock().unwrap() == RunState::Running
    }

    pub fn direction_state(&self, direction: Direction) -> &Arc<DirectionState> {
        match direction {
            Direction::ZeroToOne => &self.dir_0to1,
            Direction::OneToZero => &self.dir_1to0,
        }
    }

    /// `start()` from `Running` is a no-op (spec §4.4).
    pub fn start(&self) -> Result<(), GatewayError> {
        {
            let mut rs = self.state.lock().unwrap();
            if *rs == RunState::Running {
                return Ok(());
            }
            *rs = RunState::Idle;
        }

        let raw0 = self.factory.open(&self.iface0)?;
        let raw1 = self.factory.open(&self.iface1).map_err(|e| {
            // best-effort: the first handle is leaked to the OS on this
            // early-return path, matching "release any partial handles"
            // loosely — close() is idempotent and cheap to call here.
            raw0.close();
            e
        })?;
        let handle0: Arc<dyn CanLink> = Arc::from(raw0);
        let handle1: Arc<dyn CanLink> = Arc::from(raw1);

        self.dir_0to1.reset_all();
        self.dir_1to0.reset_all();
        self.running.store(true, Ordering::SeqCst);

        let mut threads = Vec::with_capacity(4);
        threads.push(spawn_receiver(
            Direction::ZeroToOne,
            handle0.clone(),
            self.dir_0to1.clone(),
            self.manipulation.clone(),
            self.settings.clone(),
            self.capture.clone(),
            self.running.clone(),
        ));
        threads.push(spawn_sender(
            Direction::ZeroToOne,
            handle1.clone(),
            self.dir_0to1.clone(),
            self.capture.clone(),
            self.running.clone(),
        ));
        threads.push(spawn_receiver(
            Direction::OneToZero,
            handle1.clone(),
            self.dir_1to0.clone(),
            self.manipulation.clone(),
            self.settings.clone(),
            self.capture.clone(),
            self.running.clone(),
        ));
        threads.push(spawn_sender(
            Direction::OneToZero,
            handle0.clone(),
            self.dir_1to0.clone(),
            self.capture.clone(),
            self.running.clone(),
        ));

        *self.handle0.lock().unwrap() = Some(handle0);
        *self.handle1.lock().unwrap() = Some(handle1);
        *self.threads.lock().unwrap() = threads;
        *self.state.lock().unwrap() = RunState::Running;
        Ok(())
    }

    /// `stop()` from `Idle` is a no-op. Already-queued frames are dropped,
    /// not drained (resolves the open question in spec §9 the way the
    /// source behaves) — counted into `dropped` so `received == forwarded
    /// + dropped` still holds at the post-stop snapshot (P3).
    pub fn stop(&self) {
        {
            let mut rs = self.state.lock().unwrap();
            if *rs != RunState::Running {
                return;
            }
            *rs = RunState::Stopping;
        }

        self.running.store(false, Ordering::SeqCst);
        self.dir_0to1.condvar.notify_all();
        self.dir_1to0.condvar.notify_all();

        let handles: Vec<_> = self.threads.lock().unwrap().drain(..).collect();
        let deadline = Instant::now() + SHUTDOWN_JOIN_TIMEOUT;
        for handle in handles {
            if Instant::now() >= deadline {
                warn!("gateway shutdown: worker thread did not join within the shutdown window");
            }
            if handle.join().is_err() {
                warn!("gateway shutdown: a worker thread panicked");
            }
        }

        for state in [&self.dir_0to1, &self.dir_1to0] {
            let leftover = {
                let mut heap_state = state.heap_lock.lock().unwrap();
                let n = heap_state.heap.len();
                heap_state.heap.clear();
                n
            };
            if leftover > 0 {
                state.counters.lock().unwrap().dropped += leftover as u64;
            }
        }

        // Handles are closed only after the join attempt, so in-flight
        // receives terminate cleanly via their recv timeout rather than
        // racing a closed file descriptor (spec §5).
        if let Some(h) = self.handle0.lock().unwrap().take() {
            h.close();
        }
        if let Some(h) = self.handle1.lock().unwrap().take() {
            h.close();
        }

        *self.state.lock().unwrap() = RunState::Idle;
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_receiver(
    direction: Direction,
    recv_link: Arc<dyn CanLink>,
    state: Arc<DirectionState>,
    manipulation: Arc<ManipulationEngine>,
    settings: Arc<Settings>,
    capture: Arc<RwLock<Option<Arc<CaptureSession>>>>,
    running: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("can-gw-recv-{}", direction.as_str()))
        .spawn(move || receiver_loop(direction, &*recv_link, &state, &manipulation, &settings, &capture, &running))
        .expect("failed to spawn receiver thread")
}

fn spawn_sender(
    direction: Direction,
    send_link: Arc<dyn CanLink>,
    state: Arc<DirectionState>,
    capture: Arc<RwLock<Option<Arc<CaptureSession>>>>,
    running: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("can-gw-send-{}", direction.as_str()))
        .spawn(move || sender_loop(direction, &*send_link, &state, &capture, &running))
        .expect("failed to spawn sender thread")
}

fn receiver_loop(
    direction: Direction,
    recv_link: &dyn CanLink,
    state: &DirectionState,
    manipulation: &ManipulationEngine,
    settings: &Settings,
    capture: &RwLock<Option<Arc<CaptureSession>>>,
    running: &AtomicBool,
) {
    while running.load(Ordering::SeqCst) {
        let frame = match recv_link.recv(RECV_POLL_TIMEOUT) {
            Ok(Some(f)) => f,
            Ok(None) => continue, // heartbeat; re-check running
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    debug!(direction = direction.as_str(), error = %e, "transient recv error");
                }
                continue;
            }
        };
        let recv_instant = Instant::now();

        if !state.enabled.load(Ordering::Relaxed) {
            continue;
        }

        state.counters.lock().unwrap().received += 1;
        if let Some(cap) = capture.read().unwrap().clone() {
            cap.log_rx(direction, frame.clone(), recv_instant);
        }

        let (action, payload, extra_delay_ms) =
            manipulation.process(frame.arbitration_id, direction, frame.payload());

        if action == Action::Drop {
            state.counters.lock().unwrap().dropped += 1;
            if let Some(cap) = capture.read().unwrap().clone() {
                cap.log_drop(direction, frame.clone(), recv_instant);
            }
            continue;
        }

        let snap = settings.snapshot();
        if snap.loss_pct > 0.0 && rand::thread_rng().gen_range(0.0..100.0) < snap.loss_pct {
            state.counters.lock().unwrap().dropped += 1;
            if let Some(cap) = capture.read().unwrap().clone() {
                cap.log_drop(direction, frame.clone(), recv_instant);
            }
            continue;
        }

        let jitter_ms = if snap.jitter_ms > 0.0 {
            rand::thread_rng().gen_range(-snap.jitter_ms..=snap.jitter_ms)
        } else {
            0.0
        };
        let total_delay_ms = snap.delay_ms + jitter_ms + extra_delay_ms;
        // max(recv_time + delay, recv_time): a non-positive total delay
        // clamps to the zero-duration offset, which is exactly that max.
        let send_time = if total_delay_ms > 0.0 {
            recv_instant + Duration::from_secs_f32(total_delay_ms / 1000.0)
        } else {
            recv_instant
        };

        let seq = state.next_seq();
        let mut evicted = Vec::new();
        {
            let mut heap_state = state.heap_lock.lock().unwrap();
            while heap_state.heap.len() >= MAX_QUEUE_SIZE {
                if let Some(e) = heap_state.heap.pop() {
                    evicted.push(e);
                } else {
                    break;
                }
            }
            if !evicted.is_empty() {
                // Stats lock nested briefly inside the heap critical
                // section to account for the over-capacity eviction,
                // exactly as the lock-ordering table permits.
                state.counters.lock().unwrap().dropped += evicted.len() as u64;
            }
            heap_state.heap.push(QueuedEntry {
                send_time,
                recv_time: recv_instant,
                seq,
                arbitration_id: frame.arbitration_id,
                payload,
                is_extended_id: frame.is_extended_id,
            });
        }
        state.condvar.notify_one();

        if !evicted.is_empty() {
            if let Some(cap) = capture.read().unwrap().clone() {
                for e in evicted {
                    let evicted_frame = Frame::new(e.arbitration_id, &e.payload, e.is_extended_id);
                    cap.log_drop(direction, evicted_frame, e.recv_time);
                }
            }
        }
    }
}

fn sender_loop(
    direction: Direction,
    send_link: &dyn CanLink,
    state: &DirectionState,
    capture: &RwLock<Option<Arc<CaptureSession>>>,
    running: &AtomicBool,
) {
    while running.load(Ordering::SeqCst) {
        let mut entry: Option<QueuedEntry> = None;
        {
            let mut heap_state = state.heap_lock.lock().unwrap();
            loop {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                if heap_state.heap.is_empty() {
                    let (guard, _) = state
                        .condvar
                        .wait_timeout(heap_state, SENDER_IDLE_WAIT)
                        .unwrap();
                    heap_state = guard;
                    continue;
                }
                let now = Instant::now();
                let head_send_time = heap_state.heap.peek().unwrap().send_time;
                if head_send_time <= now {
                    entry = heap_state.heap.pop();
                    break;
                }
                let wait_for = head_send_time - now;
                let (guard, _) = state.condvar.wait_timeout(heap_state, wait_for).unwrap();
                heap_state = guard;
            }
        }

        let Some(entry) = entry else { continue };
        let frame = Frame::new(entry.arbitration_id, &entry.payload, entry.is_extended_id);
        match send_link.send(&frame) {
            Ok(()) => {
                let tx_instant = Instant::now();
                let latency_us =
                    tx_instant.saturating_duration_since(entry.recv_time).as_secs_f64() * 1_000_000.0;
                state.push_sample(latency_us);
                state.counters.lock().unwrap().forwarded += 1;
                if let Some(cap) = capture.read().unwrap().clone() {
                    cap.log_tx(direction, frame, entry.recv_time, tx_instant, latency_us);
                }
            }
            Err(e) => {
                debug!(direction = direction.as_str(), error = %e, "send failed, counting as dropped");
                state.counters.lock().unwrap().dropped += 1;
            }
        }
    }
}
