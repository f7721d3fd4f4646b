//! `can-gw run` — foreground gateway daemon.
//!
//! Builds the gateway from the loaded config, starts it, and writes a
//! JSON status snapshot to `status_log` every `status_interval_secs`
//! until Ctrl-C / SIGINT. Designed to run under systemd or in a tmux
//! session; use `can-gw status` to query the log without attaching.

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use can_gw_core::{
    CanLinkFactory, Direction, Gateway, GatewayConfig, ShellInterfaceController, SocketCanLinkFactory,
};
use serde::Serialize;

use crate::config::GatewayFileConfig;

#[derive(Serialize)]
struct StatusEntry {
    ts: u64,
    iface0: String,
    iface1: String,
    delay_ms: f32,
    jitter_ms: f32,
    loss_pct: f32,
    directions: Vec<DirectionSnap>,
}

#[derive(Serialize)]
struct DirectionSnap {
    direction: &'static str,
    received: u64,
    forwarded: u64,
    dropped: u64,
    queue_size: usize,
}

pub fn run(file_config: GatewayFileConfig) -> Result<()> {
    let gateway_config = GatewayConfig {
        iface0: file_config.iface0.clone(),
        iface1: file_config.iface1.clone(),
        delay_ms: file_config.delay_ms,
        loss_pct: file_config.loss_pct,
        jitter_ms: file_config.jitter_ms,
        enable_0to1: file_config.enable_0to1,
        enable_1to0: file_config.enable_1to0,
        log_path: file_config.log_path.clone().map(Into::into),
        log_name: file_config.log_name.clone(),
    };

    let factory: Arc<dyn CanLinkFactory> = Arc::new(SocketCanLinkFactory);
    let interfaces = Arc::new(ShellInterfaceController);
    let gateway = Gateway::new(gateway_config, factory, interfaces);

    for rule in file_config.rules {
        gateway.add_rule(rule.into_rule()?);
    }

    gateway.events().subscribe(|event| {
        tracing::info!(?event, "gateway event");
    });

    eprintln!(
        "can-gw run — {} <-> {}, logging status to {} every {}s",
        file_config.iface0, file_config.iface1, file_config.status_log, file_config.status_interval_secs
    );
    gateway.start()?;

    let running = Arc::new(AtomicBool::new(true));
    let handler_running = running.clone();
    ctrlc::set_handler(move || {
        handler_running.store(false, Ordering::SeqCst);
    })?;

    // Truncate the log at startup so `status` immediately reflects this run.
    if let Ok(f) = std::fs::File::create(&file_config.status_log) {
        drop(f);
    }

    let interval = Duration::from_secs(file_config.status_interval_secs.max(1));
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(interval);
        if !running.load(Ordering::SeqCst) {
            break;
        }

        gateway.publish_stats_snapshot();
        write_status(&gateway, &file_config.status_log)?;
    }

    eprintln!("can-gw: shutting down");
    gateway.stop();
    Ok(())
}

fn write_status(gateway: &Gateway, log_path: &str) -> Result<()> {
    let cfg = gateway.get_config();
    let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();

    let entry = StatusEntry {
        ts,
        iface0: cfg.iface0,
        iface1: cfg.iface1,
        delay_ms: cfg.delay_ms,
        jitter_ms: cfg.jitter_ms,
        loss_pct: cfg.loss_pct,
        directions: [Direction::ZeroToOne, Direction::OneToZero]
            .into_iter()
            .map(|d| {
                let stats = gateway.get_stats(d);
                DirectionSnap {
                    direction: d.as_str(),
                    received: stats.received,
                    forwarded: stats.forwarded,
                    dropped: stats.dropped,
                    queue_size: stats.queue_size,
                }
            })
            .collect(),
    };

    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(log_path) {
        if let Ok(line) = serde_json::to_string(&entry) {
            let _ = writeln!(file, "{}", line);
        }
    }
    Ok(())
}
