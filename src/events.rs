// =============================================================================
// Event Log — append-only JSONL sink with content-hash idempotency
// =============================================================================
//
// One JSON object per line in `<state_dir>/events.jsonl`. Every event carries
// an `event_id`: the hex md5 of its content with the timestamp excluded, so a
// replayed or retried append of the same payload is suppressed. The dedup
// cache is bounded; on overflow the most recent half is retained.
//
// Appends are flushed and fsynced so a crash cannot lose an acknowledged
// event.
// =============================================================================

use std::collections::{HashSet, VecDeque};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::info;

/// Maximum event ids remembered for deduplication.
const EVENT_CACHE_CAPACITY: usize = 5000;

/// Current UTC timestamp in ISO format with `Z` suffix.
pub fn utc_ts() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

struct DedupCache {
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl DedupCache {
    fn new() -> Self {
        Self {
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// Returns false if the id was already present.
    fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        self.seen.insert(id.to_string());
        self.order.push_back(id.to_string());
        if self.order.len() > EVENT_CACHE_CAPACITY {
            // Drop the oldest half, keep the newest.
            let keep_from = self.order.len() / 2;
            let dropped: Vec<String> = self.order.drain(..keep_from).collect();
            for old in dropped {
                self.seen.remove(&old);
            }
        }
        true
    }
}

/// Append-only JSONL event sink shared by the broker and the session tasks.
pub struct EventLog {
    path: PathBuf,
    cache: Mutex<DedupCache>,
}

impl EventLog {
    pub fn new(state_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_dir)
            .with_context(|| format!("failed to create state dir {}", state_dir.display()))?;
        Ok(Self {
            path: state_dir.join("events.jsonl"),
            cache: Mutex::new(DedupCache::new()),
        })
    }

    /// Append an event named `event` with the given payload fields. Returns
    /// true if the line was written, false if it was a duplicate.
    pub fn append(&self, event: &str, payload: Value) -> Result<bool> {
        let mut obj = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("payload".to_string(), other);
                map
            }
        };
        obj.insert("event".to_string(), Value::from(event));

        let event_id = content_hash(&obj);
        obj.insert("event_id".to_string(), Value::from(event_id.clone()));

        if !self.cache.lock().insert(&event_id) {
            return Ok(false);
        }

        obj.entry("timestamp".to_string())
            .or_insert_with(|| Value::from(utc_ts()));

        info!(event = event, event_id = %event_id, "EVENT");

        let line = serde_json::to_string(&Value::Object(obj))
            .context("failed to serialize event")?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open event log {}", self.path.display()))?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        file.sync_data()
            .with_context(|| format!("failed to fsync event log {}", self.path.display()))?;
        Ok(true)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Stable id from the event content, timestamp excluded. serde_json maps are
/// key-sorted, so serialization is already canonical.
fn content_hash(obj: &Map<String, Value>) -> String {
    let mut content = obj.clone();
    content.remove("timestamp");
    content.remove("event_id");
    let canonical = serde_json::to_string(&Value::Object(content)).unwrap_or_default();
    format!("{:x}", md5::compute(canonical.as_bytes()))
}
