//! C6 — Gateway Facade.
//!
//! Entry-point object owned by external callers. Aggregates C2 (via
//! `GatewayCore`), C3, C4, C5, and publishes to an event bus. Grounded
//! directly on `original_source/core/gateway_manager.py`'s
//! `GatewayManager`, but constructed with an injected `CanLinkFactory`
//! rather than reaching for the source's global `set_default_factory` —
//! the redesign the spec's notes call for.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::capture::{CaptureSession, ConfigSnapshot};
use crate::direction::Direction;
use crate::error::GatewayError;
use crate::events::{EventBus, GatewayEvent};
use crate::interfaces::{InterfaceController, InterfaceState};
use crate::link::CanLinkFactory;
use crate::manipulation::ManipulationRule;
use crate::scheduler::GatewayCore;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub iface0: String,
    pub iface1: String,
    pub delay_ms: f32,
    pub loss_pct: f32,
    pub jitter_ms: f32,
    pub enable_0to1: bool,
    pub enable_1to0: bool,
    pub log_path: Option<PathBuf>,
    pub log_name: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            iface0: "vcan0".to_string(),
            iface1: "vcan1".to_string(),
            delay_ms: 0.0,
            loss_pct: 0.0,
            jitter_ms: 0.0,
            enable_0to1: true,
            enable_1to0: true,
            log_path: None,
            log_name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GatewayStats {
    pub received: u64,
    pub forwarded: u64,
    pub dropped: u64,
    pub queue_size: usize,
}

pub struct Gateway {
    core: GatewayCore,
    events: Arc<EventBus>,
    interfaces: Arc<dyn InterfaceController>,
    config: std::sync::Mutex<GatewayConfig>,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        link_factory: Arc<dyn CanLinkFactory>,
        interfaces: Arc<dyn InterfaceController>,
    ) -> Self {
        let core = GatewayCore::new(config.iface0.clone(), config.iface1.clone(), link_factory);
        core.settings
            .update(Some(config.delay_ms), Some(config.jitter_ms), Some(config.loss_pct));
        core.dir_0to1
            .enabled
            .store(config.enable_0to1, std::sync::atomic::Ordering::Relaxed);
        core.dir_1to0
            .enabled
            .store(config.enable_1to0, std::sync::atomic::Ordering::Relaxed);

        Self {
            core,
            events: Arc::new(EventBus::new()),
            interfaces,
            config: std::sync::Mutex::new(config),
        }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn is_running(&self) -> bool {
        self.core.is_running()
    }

    pub fn start(&self) -> Result<(), GatewayError> {
        if self.core.is_running() {
            return Ok(());
        }
        self.core.start()?;

        let cfg = self.config.lock().unwrap().clone();
        if !self.is_logging_enabled() {
            if let Some(path) = cfg.log_path.clone() {
                let _ = self.open_capture(&path, cfg.log_name.as_deref());
            }
        }

        self.events.publish(GatewayEvent::GatewayStarted {
            iface0: cfg.iface0,
            iface1: cfg.iface1,
            delay_ms: cfg.delay_ms,
            loss_pct: cfg.loss_pct,
            jitter_ms: cfg.jitter_ms,
        });
        Ok(())
    }

    pub fn stop(&self) {
        if !self.core.is_running() {
            return;
        }
        self.core.stop();
        self.close_capture();

        let cfg = self.config.lock().unwrap();
        self.events.publish(GatewayEvent::GatewayStopped {
            iface0: cfg.iface0.clone(),
            iface1: cfg.iface1.clone(),
        });
    }

    /// Partial update; unset fields are unchanged. `jitter_ms` below zero
    /// is clamped to zero. Pushes the change into the capture logger's
    /// live snapshot and emits `SETTINGS_CHANGED`.
    pub fn update_settings(&self, delay_ms: Option<f32>, loss_pct: Option<f32>, jitter_ms: Option<f32>) {
        let clamped_jitter = jitter_ms.map(|j| j.max(0.0));
        self.core.settings.update(delay_ms, clamped_jitter, loss_pct);

        {
            let mut cfg = self.config.lock().unwrap();
            if let Some(d) = delay_ms {
                cfg.delay_ms = d;
            }
            if let Some(j) = clamped_jitter {
                cfg.jitter_ms = j;
            }
            if let Some(l) = loss_pct {
                cfg.loss_pct = l;
            }
        }

        if let Some(session) = self.core.capture.read().unwrap().as_ref() {
            session.update_config(delay_ms, clamped_jitter, loss_pct);
        }

        self.events.publish(GatewayEvent::SettingsChanged {
            delay_ms,
            loss_pct,
            jitter_ms: clamped_jitter,
        });
    }

    pub fn set_direction_enabled(&self, direction: Direction, enabled: bool) {
        self.core
            .direction_state(direction)
            .enabled
            .store(enabled, std::sync::atomic::Ordering::Relaxed);
    }

    /// Stops the previous writer (flushing its buffers), installs the new
    /// one, and is safe against the hot path: the swap is a short write
    /// lock, the hot path takes a read lock and clones the shared handle.
    pub fn set_log_path(&self, path: Option<PathBuf>, custom_name: Option<String>) -> io::Result<()> {
        self.close_capture();
        {
            let mut cfg = self.config.lock().unwrap();
            cfg.log_path = path.clone();
            cfg.log_name = custom_name.clone();
        }
        if let Some(path) = path {
            self.open_capture(&path, custom_name.as_deref())?;
        }
        Ok(())
    }

    fn open_capture(&self, path: &Path, custom_name: Option<&str>) -> io::Result<()> {
        let snap = self.core.settings.snapshot();
        let session = CaptureSession::start(
            path,
            self.core.iface0(),
            self.core.iface1(),
            custom_name,
            ConfigSnapshot {
                delay_ms: snap.delay_ms,
                jitter_ms: snap.jitter_ms,
                loss_pct: snap.loss_pct,
            },
        )?;
        *self.core.capture.write().unwrap() = Some(Arc::new(session));
        Ok(())
    }

    fn close_capture(&self) {
        let old = self.core.capture.write().unwrap().take();
        if let Some(session) = old {
            match Arc::try_unwrap(session) {
                Ok(session) => session.stop(),
                Err(_) => {
                    // A hot-path thread still holds a clone from mid-flight;
                    // it will finish using it and the background thread
                    // will drain on its own sender drop. Nothing further
                    // to do here without blocking the caller.
                }
            }
        }
    }

    pub fn is_logging_enabled(&self) -> bool {
        self.core.capture.read().unwrap().is_some()
    }

    pub fn get_log_paths(&self) -> Option<(PathBuf, PathBuf)> {
        self.core.capture.read().unwrap().as_ref().map(|s| s.get_log_paths())
    }

    // ─── Rule pass-throughs (C3) ────────────────────────────────────────

    pub fn add_rule(&self, rule: ManipulationRule) {
        self.core.manipulation.add_rule(rule);
    }

    pub fn remove_rule(&self, name: &str) -> bool {
        self.core.manipulation.remove_rule(name)
    }

    pub fn clear_rules(&self) {
        self.core.manipulation.clear_rules();
    }

    pub fn get_rules(&self) -> Vec<ManipulationRule> {
        self.core.manipulation.get_rules()
    }

    pub fn set_rules(&self, rules: Vec<ManipulationRule>) {
        self.core.manipulation.set_rules(rules);
    }

    pub fn set_manipulation_enabled(&self, enabled: bool) {
        self.core.manipulation.set_enabled(enabled);
    }

    // ─── Read-outs ───────────────────────────────────────────────────────

    pub fn get_stats(&self, direction: Direction) -> GatewayStats {
        let state = self.core.direction_state(direction);
        let counters = *state.counters.lock().unwrap();
        GatewayStats {
            received: counters.received,
            forwarded: counters.forwarded,
            dropped: counters.dropped,
            queue_size: state.queue_size(),
        }
    }

    pub fn get_latency_samples(&self, direction: Direction) -> Vec<f64> {
        self.core.direction_state(direction).latency_samples_snapshot()
    }

    pub fn clear_latency_samples(&self, direction: Direction) {
        self.core.direction_state(direction).clear_latency_samples();
    }

    pub fn get_interface_states(&self) -> Vec<InterfaceState> {
        let cfg = self.config.lock().unwrap();
        [cfg.iface0.clone(), cfg.iface1.clone()]
            .iter()
            .filter_map(|iface| match self.interfaces.state(iface) {
                Ok(state) => Some(state),
                Err(e) => {
                    self.events.publish(GatewayEvent::InterfaceStateChanged {
                        iface: iface.clone(),
                        state: "unknown".to_string(),
                        bitrate: None,
                        error: Some(e.to_string()),
                    });
                    None
                }
            })
            .collect()
    }

    pub fn get_config(&self) -> GatewayConfig {
        self.config.lock().unwrap().clone()
    }

    /// Emits a `STATS_UPDATED` event for both directions. Not called from
    /// the hot path — intended for a periodic daemon loop (see the
    /// binary crate's `run` module).
    pub fn publish_stats_snapshot(&self) {
        for direction in [Direction::ZeroToOne, Direction::OneToZero] {
            let stats = self.get_stats(direction);
            self.events.publish(GatewayEvent::StatsUpdated {
                direction,
                received: stats.received,
                forwarded: stats.forwarded,
                dropped: stats.dropped,
                queue_size: stats.queue_size,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{MockCanLink, MockCanLinkFactory};
    use crate::manipulation::{Action, ByteOp, ByteOpKind};
    use crate::direction::RuleDirection;
    use std::time::Duration;

    fn make_gateway() -> (Gateway, MockCanLink, MockCanLink) {
        let factory = MockCanLinkFactory::new();
        let (gw0, outside0) = MockCanLink::pair();
        let (gw1, outside1) = MockCanLink::pair();
        factory.register("vcan0", Box::new(gw0));
        factory.register("vcan1", Box::new(gw1));

        let gateway = Gateway::new(
            GatewayConfig::default(),
            Arc::new(factory),
            Arc::new(crate::interfaces::NullInterfaceController),
        );
        (gateway, outside0, outside1)
    }

    #[test]
    fn start_emits_gateway_started_event() {
        let (gateway, _o0, _o1) = make_gateway();
        let seen = Arc::new(std::sync::Mutex::new(false));
        let seen2 = seen.clone();
        gateway.events().subscribe(move |event| {
            if matches!(event, GatewayEvent::GatewayStarted { .. }) {
                *seen2.lock().unwrap() = true;
            }
        });
        gateway.start().unwrap();
        assert!(*seen.lock().unwrap());
        gateway.stop();
    }

    #[test]
    fn drop_rule_scenario_4() {
        let (gateway, outside0, outside1) = make_gateway();
        gateway.add_rule(ManipulationRule {
            name: "block-0x123".into(),
            can_id: Some(0x123),
            id_mask: ManipulationRule::default_mask(),
            direction: RuleDirection::One(Direction::ZeroToOne),
            action: Action::Drop,
            byte_ops: vec![],
            enabled: true,
            extra_delay_ms: 0.0,
        });
        gateway.start().unwrap();

        outside0.send(&crate::frame::Frame::new(0x123, &[0x01], false)).unwrap();
        outside0.send(&crate::frame::Frame::new(0x456, &[0x02], false)).unwrap();

        let got = outside1.recv(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(got.arbitration_id, 0x456);
        assert!(outside1.recv(Duration::from_millis(200)).unwrap().is_none());

        std::thread::sleep(Duration::from_millis(50));
        let stats = gateway.get_stats(Direction::ZeroToOne);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.forwarded, 1);

        gateway.stop();
    }

    #[test]
    fn byte_rewrite_scenario_5() {
        let (gateway, outside0, outside1) = make_gateway();
        gateway.add_rule(ManipulationRule {
            name: "rewrite".into(),
            can_id: Some(0x100),
            id_mask: ManipulationRule::default_mask(),
            direction: RuleDirection::One(Direction::ZeroToOne),
            action: Action::Forward,
            byte_ops: vec![
                ByteOp { index: 0, op: ByteOpKind::Set, value: 0xFF },
                ByteOp { index: 1, op: ByteOpKind::Set, value: 0xAA },
            ],
            enabled: true,
            extra_delay_ms: 0.0,
        });
        gateway.start().unwrap();

        outside0.send(&crate::frame::Frame::new(0x100, &[0x01, 0x02], false)).unwrap();
        let got = outside1.recv(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(got.payload(), &[0xFF, 0xAA]);

        gateway.stop();
    }

    #[test]
    fn update_settings_clamps_negative_jitter() {
        let (gateway, _o0, _o1) = make_gateway();
        gateway.update_settings(None, None, Some(-10.0));
        assert_eq!(gateway.get_config().jitter_ms, 0.0);
    }

    #[test]
    fn stop_when_not_running_is_a_no_op() {
        let (gateway, _o0, _o1) = make_gateway();
        gateway.stop();
        assert!(!gateway.is_running());
    }

    #[test]
    fn csv_columns_and_seq_scenario_6() {
        // Scenario 6: delay=50 jitter=10, three forwarded frames -> three
        // CSV rows, seq 1..=3, forwarded, 0to1, live config columns,
        // non-empty tx_ts/latency_us, rx_ts < tx_ts. loss_pct is held at 0
        // here (rather than the scenario's literal 5%) so the row count
        // is deterministic; loss behavior itself is covered statistically
        // by `loss_expectation_property_p5` in scheduler.rs.
        let (gateway, outside0, outside1) = make_gateway();
        gateway.update_settings(Some(50.0), Some(0.0), Some(10.0));

        gateway.start().unwrap();
        let dir = std::env::temp_dir().join(format!("can-gw-facade-test-{}", std::process::id()));
        gateway.set_log_path(Some(dir.clone()), Some("scenario6".into())).unwrap();

        for i in 0..3u32 {
            outside0.send(&crate::frame::Frame::new(0x500 + i, &[i as u8], false)).unwrap();
        }
        for _ in 0..3 {
            outside1.recv(Duration::from_secs(1)).unwrap().unwrap();
        }
        std::thread::sleep(Duration::from_millis(100));

        gateway.stop();

        let csv_path = dir.join("scenario6.csv");
        let content = std::fs::read_to_string(&csv_path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(
            lines[0],
            "seq,event,direction,rx_ts,tx_ts,arb_id,dlc,data,delay_ms,jitter_ms,loss_pct,latency_us"
        );
        assert_eq!(lines.len(), 4); // header + 3 forwarded rows

        for (i, line) in lines[1..].iter().enumerate() {
            let cols: Vec<&str> = line.split(',').collect();
            assert_eq!(cols[0], (i + 1).to_string()); // seq contiguous from 1
            assert_eq!(cols[1], "forwarded");
            assert_eq!(cols[2], "0to1");
            let rx_ts: f64 = cols[3].parse().unwrap();
            let tx_ts: f64 = cols[4].parse().unwrap();
            assert!(!cols[4].is_empty());
            assert!(rx_ts < tx_ts);
            assert_eq!(cols[8], "50.0"); // delay_ms
            assert_eq!(cols[9], "10.0"); // jitter_ms
            assert_eq!(cols[10], "0.0"); // loss_pct
            assert!(!cols[11].is_empty()); // latency_us
        }

        let _ = std::fs::remove_dir_all(&dir);
    }
}
