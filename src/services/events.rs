//! Append-only NDJSON events log.
//!
//! Every pipeline stage appends one line with the required keys `ts`, `type`,
//! `event`, `service`, `level`; payload keys ride alongside. A write failure
//! must never fail the request, so errors degrade to a tracing warning.

use chrono::Utc;
use serde_json::{Map, Value, json};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

pub struct EventLog {
    path: PathBuf,
    writer: Mutex<()>,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), writer: Mutex::new(()) }
    }

    pub fn emit(&self, event: &str, payload: Value) {
        self.emit_level("info", event, payload);
    }

    pub fn emit_level(&self, level: &str, event: &str, payload: Value) {
        let mut record: Map<String, Value> = Map::new();
        record.insert("ts".to_string(), json!(Utc::now().to_rfc3339()));
        record.insert("type".to_string(), json!("event"));
        record.insert("event".to_string(), json!(event));
        record.insert("service".to_string(), json!("clinsight"));
        record.insert("level".to_string(), json!(level));
        if let Value::Object(extra) = payload {
            for (key, value) in extra {
                record.entry(key).or_insert(value);
            }
        } else if !payload.is_null() {
            record.insert("payload".to_string(), payload);
        }

        let line = Value::Object(record).to_string();
        let _guard = self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| writeln!(file, "{}", line));
        if let Err(err) = result {
            tracing::warn!("Failed to append event '{}' to {}: {}", event, self.path.display(), err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_appended_with_required_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("events.ndjson");
        let log = EventLog::new(&path);
        log.emit("oneshot.start", json!({"question": "test"}));
        log.emit_level("warn", "oneshot.timeout_near_limit", json!({"timeout_ms": 180000}));

        let content = std::fs::read_to_string(&path).expect("events file");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let value: Value = serde_json::from_str(line).expect("valid ndjson line");
            for key in ["ts", "type", "event", "service", "level"] {
                assert!(value.get(key).is_some(), "missing {}", key);
            }
        }
    }
}
