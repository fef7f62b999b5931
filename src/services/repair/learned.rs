//! Learned-fix store: remembered post-error SQL rewrites keyed by
//! `(failed_sql_hash, error_signature)`.
//!
//! Backed by one JSON file with atomic write-replace. Concurrent writers may
//! lose an update; damage is bounded because entries are content-addressed.
//! Lookup order is `updated_at` DESC with `success_count` as tiebreaker, so
//! the most recently confirmed fix wins.

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use crate::utils::sql_text::{normalize_sql, sql_hash};

static ORA_ERR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bORA-\d{5}\b").expect("valid regex"));
static DPI_ERR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bDPI-\d{4}\b").expect("valid regex"));
static DPY_ERR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bDPY-\d{4}\b").expect("valid regex"));
static SPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Canonical signature of one execution error.
pub fn error_signature(error_message: &str) -> String {
    let text = SPACE_RE.replace_all(error_message.trim(), " ").to_string();
    if text.is_empty() {
        return "UNKNOWN".to_string();
    }
    for re in [&*ORA_ERR_RE, &*DPY_ERR_RE, &*DPI_ERR_RE] {
        if let Some(m) = re.find(&text) {
            return m.as_str().to_uppercase();
        }
    }
    let lowered = text.to_lowercase();
    if lowered.contains("table not allowed") {
        return "TABLE_NOT_ALLOWED".to_string();
    }
    if lowered.contains("join limit exceeded") {
        return "JOIN_LIMIT_EXCEEDED".to_string();
    }
    if lowered.contains("where clause required") {
        return "WHERE_REQUIRED".to_string();
    }
    lowered.chars().take(80).collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LearnedFix {
    pub id: String,
    pub error_signature: String,
    pub failed_sql_hash: String,
    pub fixed_sql_hash: String,
    #[serde(default)]
    pub failed_sql_sample: String,
    pub fixed_sql: String,
    pub success_count: i64,
    pub hit_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub last_used_at: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resolution_notes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreFile {
    enabled: bool,
    max_rules: usize,
    rules: Vec<LearnedFix>,
}

impl Default for StoreFile {
    fn default() -> Self {
        Self { enabled: true, max_rules: 200, rules: Vec::new() }
    }
}

struct Cached {
    mtime: Option<SystemTime>,
    file: StoreFile,
}

pub struct LearnedFixStore {
    path: PathBuf,
    default_max_rules: usize,
    inner: Mutex<Cached>,
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

impl LearnedFixStore {
    pub fn new(path: impl Into<PathBuf>, default_max_rules: usize) -> Self {
        Self {
            path: path.into(),
            default_max_rules,
            inner: Mutex::new(Cached { mtime: None, file: StoreFile::default() }),
        }
    }

    fn load_locked<'a>(&self, cached: &'a mut Cached) -> &'a mut StoreFile {
        let mtime = file_mtime(&self.path);
        if cached.mtime != mtime || mtime.is_none() {
            cached.file = std::fs::read_to_string(&self.path)
                .ok()
                .and_then(|content| serde_json::from_str(&content).ok())
                .unwrap_or_else(|| StoreFile {
                    max_rules: self.default_max_rules,
                    ..StoreFile::default()
                });
            cached.mtime = mtime;
        }
        &mut cached.file
    }

    fn save_locked(&self, cached: &mut Cached) {
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(&cached.file) {
            Ok(content) => {
                let tmp = self.path.with_extension("tmp");
                let result = std::fs::write(&tmp, &content)
                    .and_then(|_| std::fs::rename(&tmp, &self.path));
                match result {
                    Ok(()) => cached.mtime = file_mtime(&self.path),
                    Err(err) => {
                        tracing::warn!("Failed to persist learned fixes: {}", err);
                    }
                }
            }
            Err(err) => tracing::warn!("Failed to serialize learned fixes: {}", err),
        }
    }

    /// Look up a remembered fix for this exact SQL + error signature.
    pub fn find(&self, sql: &str, error_message: &str) -> Option<LearnedFix> {
        let mut cached = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let file = self.load_locked(&mut cached);
        if !file.enabled {
            return None;
        }
        let hash = sql_hash(sql);
        let signature = error_signature(error_message);
        let mut candidates: Vec<&LearnedFix> = file
            .rules
            .iter()
            .filter(|rule| {
                rule.failed_sql_hash == hash
                    && rule.error_signature == signature
                    && !rule.fixed_sql.trim().is_empty()
            })
            .collect();
        candidates.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then(b.success_count.cmp(&a.success_count))
        });
        candidates.first().map(|rule| (*rule).clone())
    }

    /// Record that a remembered fix was applied.
    pub fn mark_used(&self, rule_id: &str) {
        let mut cached = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let file = self.load_locked(&mut cached);
        let now = Utc::now().timestamp();
        let mut touched = false;
        for rule in file.rules.iter_mut() {
            if rule.id == rule_id {
                rule.hit_count += 1;
                rule.last_used_at = now;
                touched = true;
                break;
            }
        }
        if touched {
            self.save_locked(&mut cached);
        }
    }

    /// Upsert a fix after a successful repair. Returns the stored record, or
    /// `None` when the pair is degenerate (identical SQL, blank input).
    pub fn upsert(
        &self,
        failed_sql: &str,
        fixed_sql: &str,
        error_message: &str,
        resolution_notes: &[String],
    ) -> Option<LearnedFix> {
        let failed_text = failed_sql.trim();
        let fixed_text = fixed_sql.trim();
        if failed_text.is_empty() || fixed_text.is_empty() {
            return None;
        }
        if normalize_sql(failed_text) == normalize_sql(fixed_text) {
            return None;
        }

        let mut cached = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let file = self.load_locked(&mut cached);
        if !file.enabled {
            return None;
        }

        let now = Utc::now().timestamp();
        let failed_hash = sql_hash(failed_text);
        let fixed_hash = sql_hash(fixed_text);
        let signature = error_signature(error_message);
        let mut notes: Vec<String> = Vec::new();
        for note in resolution_notes {
            let token = note.trim().to_string();
            if !token.is_empty() && !notes.contains(&token) {
                notes.push(token);
            }
        }

        let existing = file
            .rules
            .iter_mut()
            .find(|rule| rule.failed_sql_hash == failed_hash && rule.error_signature == signature);

        let stored = if let Some(rule) = existing {
            rule.fixed_sql = fixed_text.to_string();
            rule.fixed_sql_hash = fixed_hash;
            rule.success_count += 1;
            rule.updated_at = now;
            rule.last_used_at = now;
            if !notes.is_empty() {
                rule.resolution_notes = notes;
            }
            rule.clone()
        } else {
            let created = LearnedFix {
                id: uuid::Uuid::new_v4().simple().to_string(),
                error_signature: signature,
                failed_sql_hash: failed_hash,
                fixed_sql_hash: fixed_hash,
                failed_sql_sample: failed_text.chars().take(500).collect(),
                fixed_sql: fixed_text.to_string(),
                success_count: 1,
                hit_count: 0,
                created_at: now,
                updated_at: now,
                last_used_at: now,
                resolution_notes: notes,
            };
            file.rules.push(created.clone());
            created
        };

        let max_rules = if file.max_rules == 0 { self.default_max_rules } else { file.max_rules };
        if file.rules.len() > max_rules {
            // LRU by updated_at; insertion order breaks same-second ties.
            let mut indexed: Vec<(usize, LearnedFix)> =
                file.rules.drain(..).enumerate().collect();
            indexed.sort_by(|a, b| b.1.updated_at.cmp(&a.1.updated_at).then(b.0.cmp(&a.0)));
            indexed.truncate(max_rules);
            indexed.reverse();
            file.rules = indexed.into_iter().map(|(_, rule)| rule).collect();
        }

        self.save_locked(&mut cached);
        Some(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_prefers_error_codes_then_markers() {
        assert_eq!(error_signature("ORA-00904: \"X\": invalid identifier"), "ORA-00904");
        assert_eq!(error_signature("DPY-4024: call timeout"), "DPY-4024");
        assert_eq!(error_signature("Table not allowed: ICUSTAYS"), "TABLE_NOT_ALLOWED");
        assert_eq!(error_signature("WHERE clause required"), "WHERE_REQUIRED");
        assert_eq!(error_signature(""), "UNKNOWN");
    }

    #[test]
    fn upsert_twice_increments_success_count_once_per_call() {
        let dir = tempfile::tempdir().unwrap();
        let store = LearnedFixStore::new(dir.path().join("rules.json"), 200);

        let failed = "SELECT MEDICATION FROM PRESCRIPTIONS WHERE ROWNUM <= 5";
        let fixed = "SELECT DRUG FROM PRESCRIPTIONS WHERE ROWNUM <= 5";
        let first = store
            .upsert(failed, fixed, "ORA-00904: \"MEDICATION\"", &[])
            .expect("created");
        assert_eq!(first.success_count, 1);

        let second = store
            .upsert(failed, fixed, "ORA-00904: \"MEDICATION\"", &[])
            .expect("updated");
        assert_eq!(second.success_count, 2);
        assert_eq!(second.id, first.id);

        let found = store.find(failed, "ORA-00904: something").expect("found");
        assert_eq!(found.fixed_sql, fixed);
    }

    #[test]
    fn identical_sql_is_not_stored() {
        let dir = tempfile::tempdir().unwrap();
        let store = LearnedFixStore::new(dir.path().join("rules.json"), 200);
        assert!(store
            .upsert("SELECT 1 FROM DUAL", "select 1   from dual", "ORA-00942", &[])
            .is_none());
    }

    #[test]
    fn store_is_bounded_lru_by_updated_at() {
        let dir = tempfile::tempdir().unwrap();
        let store = LearnedFixStore::new(dir.path().join("rules.json"), 2);
        for i in 0..3 {
            store
                .upsert(
                    &format!("SELECT {} FROM DUAL", i),
                    &format!("SELECT {} + 0 FROM DUAL", i),
                    "ORA-00942",
                    &[],
                )
                .unwrap();
        }
        let oldest = store.find("SELECT 0 FROM DUAL", "ORA-00942");
        assert!(oldest.is_none(), "oldest entry should have been evicted");
        assert!(store.find("SELECT 2 FROM DUAL", "ORA-00942").is_some());
    }

    #[test]
    fn hit_count_tracks_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let store = LearnedFixStore::new(dir.path().join("rules.json"), 200);
        let fix = store
            .upsert("SELECT A FROM T WHERE X = 1", "SELECT B FROM T WHERE X = 1", "ORA-00904", &[])
            .unwrap();
        store.mark_used(&fix.id);
        let found = store.find("SELECT A FROM T WHERE X = 1", "ORA-00904").unwrap();
        assert_eq!(found.hit_count, 1);
    }
}
