//! `can-gw status` — show the most recent snapshot from the status log.
//!
//! Reads the last line of the daemon's JSONL status log and prints a
//! static one-shot table. Use this to check on a running `can-gw run`
//! without attaching to its terminal.

use anyhow::Result;
use chrono::{TimeZone, Utc};

pub fn run(log_path: &str) -> Result<()> {
    let content = match std::fs::read_to_string(log_path) {
        Ok(c) => c,
        Err(_) => {
            eprintln!("No status log found at {}.", log_path);
            eprintln!("Start the gateway first:  can-gw run");
            return Ok(());
        }
    };

    let line = match content.lines().filter(|l| !l.is_empty()).last() {
        Some(l) => l,
        None => {
            eprintln!("Status log is empty — gateway may just be starting.");
            return Ok(());
        }
    };

    let entry: serde_json::Value = serde_json::from_str(line)?;
    let ts = entry["ts"].as_u64().unwrap_or(0) as i64;
    let time_str = Utc
        .timestamp_opt(ts, 0)
        .single()
        .map(|d| d.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "unknown".into());

    let iface0 = entry["iface0"].as_str().unwrap_or("?");
    let iface1 = entry["iface1"].as_str().unwrap_or("?");

    let width = 78;
    println!("{:=<width$}", "");
    println!("{:^width$}", format!(" CAN-GW STATUS  {} ", time_str));
    println!("{:=<width$}", "");
    println!(
        "  {} <-> {}   delay={:.1}ms  jitter={:.1}ms  loss={:.1}%",
        iface0,
        iface1,
        entry["delay_ms"].as_f64().unwrap_or(0.0),
        entry["jitter_ms"].as_f64().unwrap_or(0.0),
        entry["loss_pct"].as_f64().unwrap_or(0.0),
    );
    println!();
    println!(
        "{:<8}  {:>10}  {:>10}  {:>10}  {:>10}",
        "DIR", "RECEIVED", "FORWARDED", "DROPPED", "QUEUED"
    );
    println!("{:-<width$}", "");

    if let Some(dirs) = entry["directions"].as_array() {
        for d in dirs {
            println!(
                "{:<8}  {:>10}  {:>10}  {:>10}  {:>10}",
                d["direction"].as_str().unwrap_or("?"),
                d["received"].as_u64().unwrap_or(0),
                d["forwarded"].as_u64().unwrap_or(0),
                d["dropped"].as_u64().unwrap_or(0),
                d["queue_size"].as_u64().unwrap_or(0),
            );
        }
    }
    println!("{:-<width$}", "");

    Ok(())
}
