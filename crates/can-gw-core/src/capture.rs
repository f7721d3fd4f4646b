//! C5 — Capture Logger.
//!
//! Two artifacts per session: a binary capture file (every RX and every TX
//! event, channel = 1/2, session-relative timestamps) and a metadata CSV
//! (one row per forwarded or dropped frame). The hot path never touches a
//! file directly — it sends a `CaptureEvent` down an unbounded channel to a
//! dedicated background thread, the same non-blocking-producer pattern the
//! teacher's `spawn_capture_thread`/`CaptureWriter` use, just without their
//! rotation machinery (one session here means exactly one pair of files).

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};
use pcap_file::pcap::{PcapHeader, PcapPacket, PcapWriter};
use pcap_file::{DataLink, Endianness, TsResolution};
use tracing::warn;

use crate::direction::Direction;
use crate::frame::Frame;

/// Live (delay_ms, jitter_ms, loss_pct) snapshot, pushed into by the
/// facade on every settings change so CSV rows reflect the configuration
/// active at write time, not at session start.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfigSnapshot {
    pub delay_ms: f32,
    pub jitter_ms: f32,
    pub loss_pct: f32,
}

/// Fed to the background capture thread. Carries everything needed to
/// write both artifacts without the thread touching any shared lock
/// beyond the config snapshot.
enum CaptureEvent {
    Rx {
        direction: Direction,
        frame: Frame,
        ts: f64,
    },
    Tx {
        direction: Direction,
        frame: Frame,
        rx_ts: f64,
        tx_ts: f64,
        latency_us: f64,
    },
    Drop {
        direction: Direction,
        frame: Frame,
        rx_ts: f64,
    },
}

/// Binary artifact writer. A byte-exact Vector BLF encoder is explicitly
/// "assumed library-provided" per the spec and no maintained BLF crate
/// exists in this dependency stack; this writer substitutes the
/// `pcap-file` crate (already used by the teacher for binary capture
/// output) as the container, preserving the architecturally-specified
/// properties — one file per session, channel 1/2, session-relative
/// timestamps, RX+TX only — under the spec-mandated `.blf` filename. See
/// DESIGN.md for the rationale.
struct BlfCaptureWriter {
    writer: PcapWriter<BufWriter<File>>,
}

impl BlfCaptureWriter {
    fn create(path: &Path) -> io::Result<Self> {
        let file = File::create(path)?;
        let header = PcapHeader {
            version_major: 2,
            version_minor: 4,
            ts_correction: 0,
            ts_accuracy: 0,
            snaplen: 65535,
            datalink: DataLink::ETHERNET,
            ts_resolution: TsResolution::NanoSecond,
            endianness: Endianness::native(),
        };
        let writer = PcapWriter::with_header(BufWriter::new(file), header)
            .map_err(|e| io::Error::other(e.to_string()))?;
        Ok(Self { writer })
    }

    /// 16-byte record header (arb_id, dlc, channel, extended flag, pad)
    /// followed by up to 8 payload bytes.
    fn encode_record(direction: Direction, frame: &Frame) -> Vec<u8> {
        let mut rec = Vec::with_capacity(16 + crate::frame::MAX_PAYLOAD_LEN);
        rec.extend_from_slice(&frame.arbitration_id.to_le_bytes());
        rec.push(frame.dlc());
        rec.push(direction.channel());
        rec.push(frame.is_extended_id as u8);
        rec.push(0); // pad
        rec.extend_from_slice(frame.payload());
        rec
    }

    fn write(&mut self, direction: Direction, frame: &Frame, session_relative_secs: f64) -> io::Result<()> {
        let record = Self::encode_record(direction, frame);
        let timestamp = std::time::Duration::from_secs_f64(session_relative_secs.max(0.0));
        let packet = PcapPacket::new(timestamp, record.len() as u32, &record);
        self.writer
            .write_packet(&packet)
            .map_err(|e| io::Error::other(e.to_string()))
    }
}

/// Metadata CSV writer, columns in the exact order the spec requires.
/// Hand-rolled via `BufWriter` + `writeln!`, matching the teacher's own
/// `CsvCaptureWriter` technique for this fixed, small schema rather than
/// reaching for a dedicated CSV crate.
struct CsvMetadataWriter {
    writer: BufWriter<File>,
    seq: u64,
}

const CSV_HEADER: &str =
    "seq,event,direction,rx_ts,tx_ts,arb_id,dlc,data,delay_ms,jitter_ms,loss_pct,latency_us";

impl CsvMetadataWriter {
    fn create(path: &Path) -> io::Result<Self> {
        let mut writer = BufWriter::new(File::create(path)?);
        writeln!(writer, "{}", CSV_HEADER)?;
        Ok(Self { writer, seq: 0 })
    }

    fn data_hex(frame: &Frame) -> String {
        frame
            .payload()
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn write_row(
        &mut self,
        event: &str,
        direction: Direction,
        rx_ts: f64,
        tx_ts: Option<f64>,
        frame: &Frame,
        cfg: ConfigSnapshot,
        latency_us: Option<f64>,
    ) -> io::Result<()> {
        self.seq += 1;
        let tx_ts_s = tx_ts.map(|t| format!("{:.6}", t)).unwrap_or_default();
        let latency_s = latency_us.map(|l| format!("{:.0}", l)).unwrap_or_default();
        writeln!(
            self.writer,
            "{},{},{},{:.6},{},{},{},{},{:.1},{:.1},{:.1},{}",
            self.seq,
            event,
            direction.as_str(),
            rx_ts,
            tx_ts_s,
            frame.id_hex(),
            frame.dlc(),
            Self::data_hex(frame),
            cfg.delay_ms,
            cfg.jitter_ms,
            cfg.loss_pct,
            latency_s,
        )
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Owns both writers plus the atomically-swappable live config snapshot.
/// One instance per active logging session. Construction spawns the
/// background thread; `stop` drains and joins it.
pub struct CaptureSession {
    start_instant: Instant,
    started_at_wallclock: chrono::DateTime<chrono::Utc>,
    tx: Sender<CaptureEvent>,
    thread: Option<std::thread::JoinHandle<()>>,
    config: Arc<Mutex<ConfigSnapshot>>,
    binary_path: PathBuf,
    csv_path: PathBuf,
}

impl CaptureSession {
    pub fn start(
        base_path: &Path,
        iface0: &str,
        iface1: &str,
        custom_name: Option<&str>,
        initial_config: ConfigSnapshot,
    ) -> io::Result<Self> {
        fs::create_dir_all(base_path)?;

        let stem = match custom_name {
            Some(name) => name.to_string(),
            None => format!(
                "gateway_{}_{}_{}",
                iface0,
                iface1,
                chrono::Utc::now().format("%Y%m%d_%H%M%S")
            ),
        };
        let binary_path = base_path.join(format!("{stem}.blf"));
        let csv_path = base_path.join(format!("{stem}.csv"));

        let binary_writer = BlfCaptureWriter::create(&binary_path)?;
        let csv_writer = CsvMetadataWriter::create(&csv_path)?;

        let (tx, rx): (Sender<CaptureEvent>, Receiver<CaptureEvent>) = crossbeam_channel::unbounded();
        let config = Arc::new(Mutex::new(initial_config));
        let thread_config = config.clone();

        let thread = std::thread::Builder::new()
            .name("capture".into())
            .spawn(move || run_capture_thread(rx, binary_writer, csv_writer, thread_config))
            .expect("failed to spawn capture thread");

        Ok(Self {
            start_instant: Instant::now(),
            started_at_wallclock: chrono::Utc::now(),
            tx,
            thread: Some(thread),
            config,
            binary_path,
            csv_path,
        })
    }

    fn session_relative(&self, at: Instant) -> f64 {
        at.saturating_duration_since(self.start_instant).as_secs_f64()
    }

    /// Non-blocking from the hot path's perspective: this is a channel
    /// send, the actual file write happens off-thread.
    pub fn log_rx(&self, direction: Direction, frame: Frame, recv_instant: Instant) {
        let ts = self.session_relative(recv_instant);
        let _ = self.tx.send(CaptureEvent::Rx { direction, frame, ts });
    }

    pub fn log_tx(
        &self,
        direction: Direction,
        frame: Frame,
        recv_instant: Instant,
        tx_instant: Instant,
        latency_us: f64,
    ) {
        let rx_ts = self.session_relative(recv_instant);
        let tx_ts = self.session_relative(tx_instant);
        let _ = self.tx.send(CaptureEvent::Tx {
            direction,
            frame,
            rx_ts,
            tx_ts,
            latency_us,
        });
    }

    pub fn log_drop(&self, direction: Direction, frame: Frame, recv_instant: Instant) {
        let rx_ts = self.session_relative(recv_instant);
        let _ = self.tx.send(CaptureEvent::Drop { direction, frame, rx_ts });
    }

    /// Pushed by the facade on every settings change so CSV rows reflect
    /// the live configuration rather than the one in effect at session
    /// start.
    pub fn update_config(&self, delay_ms: Option<f32>, jitter_ms: Option<f32>, loss_pct: Option<f32>) {
        let mut cfg = self.config.lock().unwrap();
        if let Some(v) = delay_ms {
            cfg.delay_ms = v;
        }
        if let Some(v) = jitter_ms {
            cfg.jitter_ms = v;
        }
        if let Some(v) = loss_pct {
            cfg.loss_pct = v;
        }
    }

    pub fn get_log_paths(&self) -> (PathBuf, PathBuf) {
        (self.binary_path.clone(), self.csv_path.clone())
    }

    pub fn started_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.started_at_wallclock
    }

    /// Drops the sender (closing the channel), then joins the background
    /// thread so both writers are flushed before this returns.
    pub fn stop(self) {
        let CaptureSession { tx, thread, .. } = self;
        drop(tx);
        if let Some(handle) = thread {
            let _ = handle.join();
        }
    }
}

fn run_capture_thread(
    rx: Receiver<CaptureEvent>,
    mut binary: BlfCaptureWriter,
    mut csv: CsvMetadataWriter,
    config: Arc<Mutex<ConfigSnapshot>>,
) {
    for event in rx {
        match event {
            CaptureEvent::Rx { direction, frame, ts } => {
                if let Err(e) = binary.write(direction, &frame, ts) {
                    warn!("capture: binary write failed: {}", e);
                }
            }
            CaptureEvent::Tx {
                direction,
                frame,
                rx_ts,
                tx_ts,
                latency_us,
            } => {
                if let Err(e) = binary.write(direction, &frame, tx_ts) {
                    warn!("capture: binary write failed: {}", e);
                }
                let cfg = *config.lock().unwrap();
                if let Err(e) = csv.write_row(
                    "forwarded",
                    direction,
                    rx_ts,
                    Some(tx_ts),
                    &frame,
                    cfg,
                    Some(latency_us),
                ) {
                    warn!("capture: csv write failed: {}", e);
                }
            }
            CaptureEvent::Drop { direction, frame, rx_ts } => {
                let cfg = *config.lock().unwrap();
                if let Err(e) = csv.write_row("dropped", direction, rx_ts, None, &frame, cfg, None) {
                    warn!("capture: csv write failed: {}", e);
                }
            }
        }
    }
    if let Err(e) = csv.flush() {
        warn!("capture: final csv flush failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;

    #[test]
    fn session_writes_header_and_rows() {
        let dir = std::env::temp_dir().join(format!("can-gw-capture-test-{}", std::process::id()));
        let session = CaptureSession::start(
            &dir,
            "vcan0",
            "vcan1",
            Some("test-session"),
            ConfigSnapshot {
                delay_ms: 50.0,
                jitter_ms: 10.0,
                loss_pct: 5.0,
            },
        )
        .unwrap();

        let frame = Frame::new(0x123, &[0x11, 0x22], false);
        let t0 = Instant::now();
        session.log_rx(Direction::ZeroToOne, frame.clone(), t0);
        session.log_tx(Direction::ZeroToOne, frame.clone(), t0, t0, 1234.0);
        session.log_drop(Direction::ZeroToOne, frame, t0);

        let (_binary_path, csv_path) = session.get_log_paths();
        session.stop();

        let file = File::open(&csv_path).unwrap();
        let lines: Vec<String> = io::BufReader::new(file).lines().map(|l| l.unwrap()).collect();
        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(lines.len(), 3); // header + forwarded + dropped
        assert!(lines[1].starts_with("1,forwarded,0to1,"));
        assert!(lines[2].starts_with("2,dropped,0to1,"));

        let _ = fs::remove_dir_all(&dir);
    }
}
