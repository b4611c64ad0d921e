//! Persistence layer.
//!
//! Two append/overwrite targets, both plain files:
//! - an event log, one JSON `EventRecord` per line (`JsonlEventSink`)
//! - the latest engine snapshot as pretty JSON, rewritten periodically
//!
//! The engine never reads either back; they exist for operators and for
//! post-run analysis.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::engine::events::{EventRecord, EventSink};
use crate::engine::snapshot::EngineSnapshot;

fn ensure_parent(path: &str) -> Result<()> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Event log
// ---------------------------------------------------------------------------

/// Appends every engine event to a JSONL file.
pub struct JsonlEventSink {
    path: String,
    writer: Mutex<BufWriter<File>>,
}

impl JsonlEventSink {
    pub fn open(path: &str) -> Result<Self> {
        ensure_parent(path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open event log {path}"))?;
        info!(path, "Event log opened");
        Ok(Self {
            path: path.to_string(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn append(&self, record: &EventRecord) -> Result<()> {
        let line = serde_json::to_string(record).context("Failed to serialise event")?;
        let mut writer = self.writer.lock();
        writeln!(writer, "{line}").context("Failed to append event")?;
        writer.flush().context("Failed to flush event log")?;
        Ok(())
    }
}

impl EventSink for JsonlEventSink {
    fn record(&self, record: &EventRecord) {
        if let Err(e) = self.append(record) {
            error!(path = %self.path, error = %e, "Event not persisted");
        }
    }
}

/// Read an event log back (tests and offline tooling).
pub fn read_events(path: &str) -> Result<Vec<EventRecord>> {
    let contents = std::fs::read_to_string(path).with_context(|| format!("Failed to read event log {path}"))?;
    contents
        .lines()
        .filter(|l| !l.trim().is_empty())
        .enumerate()
        .map(|(i, line)| {
            serde_json::from_str(line).with_context(|| format!("Malformed event on line {} of {path}", i + 1))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// Write the snapshot as pretty JSON. Goes through a temp file so a reader
/// never sees a half-written snapshot.
pub fn save_snapshot(snapshot: &EngineSnapshot, path: &str) -> Result<()> {
    ensure_parent(path)?;
    let json = serde_json::to_string_pretty(snapshot).context("Failed to serialise snapshot")?;
    let tmp = format!("{path}.tmp");
    std::fs::write(&tmp, &json).with_context(|| format!("Failed to write snapshot to {tmp}"))?;
    std::fs::rename(&tmp, path).with_context(|| format!("Failed to move snapshot into {path}"))?;
    debug!(path, tick = snapshot.tick, triangles = snapshot.triangles.len(), "Snapshot saved");
    Ok(())
}

/// Load a snapshot. Returns `None` if the file doesn't exist.
pub fn load_snapshot(path: &str) -> Result<Option<EngineSnapshot>> {
    if !Path::new(path).exists() {
        return Ok(None);
    }
    let json = std::fs::read_to_string(path).with_context(|| format!("Failed to read snapshot from {path}"))?;
    let snapshot = serde_json::from_str(&json).with_context(|| format!("Failed to parse snapshot from {path}"))?;
    Ok(Some(snapshot))
}

/// Persist every `every_ticks`-th snapshot published on `rx`, plus the last
/// one when the engine drops its sender.
pub async fn run_snapshot_writer(mut rx: watch::Receiver<EngineSnapshot>, path: String, every_ticks: u64) {
    let every = every_ticks.max(1);
    let mut last_saved = 0;
    while rx.changed().await.is_ok() {
        let snapshot = rx.borrow_and_update().clone();
        if snapshot.tick >= last_saved + every {
            match save_snapshot(&snapshot, &path) {
                Ok(()) => last_saved = snapshot.tick,
                Err(e) => error!(path = %path, error = %e, "Snapshot not saved"),
            }
        }
    }
    let last = rx.borrow().clone();
    if last.tick > last_saved {
        if let Err(e) = save_snapshot(&last, &path) {
            error!(path = %path, error = %e, "Final snapshot not saved");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
