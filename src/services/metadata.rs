//! Metadata cache: JSONL corpora, schema catalog, join graph, and the
//! table-scope settings store.
//!
//! One mutex guards an mtime map; every read lazily reloads a file only when
//! its mtime moved. Files are written atomically (tmp + rename) so concurrent
//! readers never see partial JSON.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use crate::models::{Doc, DocKind};
use crate::utils::{ApiError, ApiResult};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type", default)]
    pub data_type: String,
    #[serde(default)]
    pub nullable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TableInfo {
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub columns: Vec<ColumnInfo>,
    #[serde(default)]
    pub primary_keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SchemaCatalog {
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub requested_owner: String,
    #[serde(default)]
    pub owners: Vec<String>,
    #[serde(default)]
    pub tables: HashMap<String, TableInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JoinEdge {
    #[serde(default)]
    pub from_schema: String,
    pub from_table: String,
    pub from_column: String,
    #[serde(default)]
    pub to_schema: String,
    pub to_table: String,
    pub to_column: String,
    #[serde(rename = "type", default)]
    pub edge_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JoinGraph {
    #[serde(default)]
    pub edges: Vec<JoinEdge>,
}

/// Per-user table scopes with a global fallback.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TableScopeSettings {
    #[serde(default)]
    pub global: Vec<String>,
    #[serde(default)]
    pub users: HashMap<String, Vec<String>>,
}

/// One `(table, column, value, description)` dictionary row.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ColumnValueEntry {
    pub table: String,
    pub column: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub description: String,
}

/// Clinical term to ICD-prefix mapping (diagnosis or procedure).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IcdMapEntry {
    pub term: String,
    #[serde(default)]
    pub prefixes: Vec<String>,
}

/// Label-intent profile binding a clinical concept to `D_ITEMS.LABEL`
/// anchor keywords.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LabelIntentProfile {
    pub name: String,
    #[serde(default)]
    pub anchor_terms: Vec<String>,
    #[serde(default)]
    pub required_terms: Vec<String>,
    #[serde(default)]
    pub hint: String,
}

/// Identifier rename applied by the SQL post-processor (alias typo fixes).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SchemaHint {
    pub from: String,
    pub to: String,
}

struct Stamped<T> {
    mtime: Option<SystemTime>,
    value: Arc<T>,
}

#[derive(Default)]
struct Inner {
    docs: HashMap<DocKind, Stamped<Vec<Doc>>>,
    catalog: Option<Stamped<SchemaCatalog>>,
    join_graph: Option<Stamped<JoinGraph>>,
    scope: Option<Stamped<TableScopeSettings>>,
    column_values: Option<Stamped<Vec<ColumnValueEntry>>>,
    diagnosis_map: Option<Stamped<Vec<IcdMapEntry>>>,
    procedure_map: Option<Stamped<Vec<IcdMapEntry>>>,
    label_intents: Option<Stamped<Vec<LabelIntentProfile>>>,
    schema_hints: Option<Stamped<Vec<SchemaHint>>>,
    demo_cache: Option<Stamped<HashMap<String, String>>>,
}

impl<T> Default for Stamped<T>
where
    T: Default,
{
    fn default() -> Self {
        Self { mtime: None, value: Arc::new(T::default()) }
    }
}

pub struct MetadataCache {
    dir: PathBuf,
    inner: Mutex<Inner>,
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn atomic_write(path: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)
}

impl MetadataCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), inner: Mutex::new(Inner::default()) }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn corpus_path(&self, kind: DocKind) -> PathBuf {
        self.dir.join(format!("{}.jsonl", kind.as_str()))
    }

    fn catalog_path(&self) -> PathBuf {
        self.dir.join("schema_catalog.json")
    }

    fn join_graph_path(&self) -> PathBuf {
        self.dir.join("join_graph.json")
    }

    fn scope_path(&self) -> PathBuf {
        self.dir.join("table_scope.json")
    }

    /// Corpus documents of one kind; empty when the file is absent.
    pub fn docs(&self, kind: DocKind) -> Arc<Vec<Doc>> {
        let path = self.corpus_path(kind);
        let mtime = file_mtime(&path);
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(entry) = inner.docs.get(&kind) {
            if entry.mtime == mtime {
                return Arc::clone(&entry.value);
            }
        }
        let docs = Arc::new(load_jsonl_docs(&path, kind));
        inner.docs.insert(kind, Stamped { mtime, value: Arc::clone(&docs) });
        docs
    }

    pub fn schema_catalog(&self) -> Arc<SchemaCatalog> {
        let path = self.catalog_path();
        let mtime = file_mtime(&path);
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(entry) = &inner.catalog {
            if entry.mtime == mtime {
                return Arc::clone(&entry.value);
            }
        }
        let catalog: SchemaCatalog = read_json_or_default(&path);
        let catalog = Arc::new(catalog);
        inner.catalog = Some(Stamped { mtime, value: Arc::clone(&catalog) });
        catalog
    }

    pub fn join_graph(&self) -> Arc<JoinGraph> {
        let path = self.join_graph_path();
        let mtime = file_mtime(&path);
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(entry) = &inner.join_graph {
            if entry.mtime == mtime {
                return Arc::clone(&entry.value);
            }
        }
        let graph: JoinGraph = read_json_or_default(&path);
        let graph = Arc::new(graph);
        inner.join_graph = Some(Stamped { mtime, value: Arc::clone(&graph) });
        graph
    }

    pub fn table_scope_settings(&self) -> Arc<TableScopeSettings> {
        let path = self.scope_path();
        let mtime = file_mtime(&path);
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(entry) = &inner.scope {
            if entry.mtime == mtime {
                return Arc::clone(&entry.value);
            }
        }
        let scope: TableScopeSettings = read_json_or_default(&path);
        let scope = Arc::new(scope);
        inner.scope = Some(Stamped { mtime, value: Arc::clone(&scope) });
        scope
    }

    /// Effective table scope: the user's scope when present, else the global
    /// scope. Names are returned as stored (original case).
    pub fn load_table_scope(&self, user: Option<&str>) -> Vec<String> {
        let settings = self.table_scope_settings();
        if let Some(user) = user {
            if let Some(scope) = settings.users.get(user) {
                if !scope.is_empty() {
                    return scope.clone();
                }
            }
        }
        settings.global.clone()
    }

    pub fn save_table_scope(&self, user: Option<&str>, tables: Vec<String>) -> ApiResult<()> {
        let mut settings = (*self.table_scope_settings()).clone();
        match user {
            Some(user) => {
                settings.users.insert(user.to_string(), tables);
            }
            None => settings.global = tables,
        }
        let content = serde_json::to_string_pretty(&settings)?;
        atomic_write(&self.scope_path(), &content)
            .map_err(|e| ApiError::internal_error(format!("Failed to save table scope: {}", e)))?;
        Ok(())
    }

    pub fn schema_table_count(&self) -> usize {
        self.schema_catalog().tables.len()
    }

    /// A scope covering >= 80% of the catalog is treated as "all tables".
    pub fn scope_is_effectively_all(&self, scope: &[String]) -> bool {
        let total = self.schema_table_count();
        if scope.is_empty() || total == 0 {
            return scope.is_empty();
        }
        (scope.len() as f64 / total as f64) >= 0.80
    }

    /// Owner recorded in the schema catalog for one table, used for the
    /// ORA-00942 owner-retry path.
    pub fn table_owner(&self, table: &str) -> Option<String> {
        let catalog = self.schema_catalog();
        let upper = table.to_uppercase();
        catalog
            .tables
            .iter()
            .find(|(name, _)| name.to_uppercase() == upper)
            .map(|(_, info)| {
                if info.owner.is_empty() { catalog.owner.clone() } else { info.owner.clone() }
            })
            .filter(|owner| !owner.is_empty())
    }

    pub fn column_values(&self) -> Arc<Vec<ColumnValueEntry>> {
        let path = self.dir.join("column_values.json");
        let mtime = file_mtime(&path);
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(entry) = &inner.column_values {
            if entry.mtime == mtime {
                return Arc::clone(&entry.value);
            }
        }
        let entries: Vec<ColumnValueEntry> = read_json_or_default(&path);
        let entries = Arc::new(entries);
        inner.column_values = Some(Stamped { mtime, value: Arc::clone(&entries) });
        entries
    }

    pub fn diagnosis_map(&self) -> Arc<Vec<IcdMapEntry>> {
        let path = self.dir.join("diagnosis_map_terms.json");
        let mtime = file_mtime(&path);
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(entry) = &inner.diagnosis_map {
            if entry.mtime == mtime {
                return Arc::clone(&entry.value);
            }
        }
        let entries: Vec<IcdMapEntry> = read_json_or_default(&path);
        let entries = Arc::new(entries);
        inner.diagnosis_map = Some(Stamped { mtime, value: Arc::clone(&entries) });
        entries
    }

    pub fn procedure_map(&self) -> Arc<Vec<IcdMapEntry>> {
        let path = self.dir.join("procedure_map_terms.json");
        let mtime = file_mtime(&path);
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(entry) = &inner.procedure_map {
            if entry.mtime == mtime {
                return Arc::clone(&entry.value);
            }
        }
        let entries: Vec<IcdMapEntry> = read_json_or_default(&path);
        let entries = Arc::new(entries);
        inner.procedure_map = Some(Stamped { mtime, value: Arc::clone(&entries) });
        entries
    }

    pub fn label_intents(&self) -> Arc<Vec<LabelIntentProfile>> {
        let path = self.dir.join("label_intent_profiles.json");
        let mtime = file_mtime(&path);
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(entry) = &inner.label_intents {
            if entry.mtime == mtime {
                return Arc::clone(&entry.value);
            }
        }
        let entries: Vec<LabelIntentProfile> = read_json_or_default(&path);
        let entries = Arc::new(entries);
        inner.label_intents = Some(Stamped { mtime, value: Arc::clone(&entries) });
        entries
    }

    pub fn schema_hints(&self) -> Arc<Vec<SchemaHint>> {
        let path = self.dir.join("sql_schema_hints.json");
        let mtime = file_mtime(&path);
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(entry) = &inner.schema_hints {
            if entry.mtime == mtime {
                return Arc::clone(&entry.value);
            }
        }
        let hints: Vec<SchemaHint> = read_json_or_default(&path);
        let hints = Arc::new(hints);
        inner.schema_hints = Some(Stamped { mtime, value: Arc::clone(&hints) });
        hints
    }

    /// Pre-generated question -> SQL demo cache, keyed by normalized
    /// question text.
    pub fn demo_cache(&self) -> Arc<HashMap<String, String>> {
        let path = self.dir.join("demo_cache.json");
        let mtime = file_mtime(&path);
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(entry) = &inner.demo_cache {
            if entry.mtime == mtime {
                return Arc::clone(&entry.value);
            }
        }
        let raw: HashMap<String, String> = read_json_or_default(&path);
        let normalized: HashMap<String, String> = raw
            .into_iter()
            .map(|(question, sql)| (crate::utils::text::normalize(&question), sql))
            .collect();
        let normalized = Arc::new(normalized);
        inner.demo_cache = Some(Stamped { mtime, value: Arc::clone(&normalized) });
        normalized
    }

    pub fn demo_cache_lookup(&self, question: &str) -> Option<String> {
        self.demo_cache()
            .get(&crate::utils::text::normalize(question))
            .cloned()
    }

    /// Drop every cached entry; the next read reloads from disk.
    pub fn invalidate(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.docs.clear();
        inner.catalog = None;
        inner.join_graph = None;
        inner.scope = None;
        inner.column_values = None;
        inner.diagnosis_map = None;
        inner.procedure_map = None;
        inner.label_intents = None;
        inner.schema_hints = None;
        inner.demo_cache = None;
    }
}

fn read_json_or_default<T: Default + for<'de> Deserialize<'de>>(path: &Path) -> T {
    match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|err| {
            tracing::warn!("Malformed JSON in {}: {}", path.display(), err);
            T::default()
        }),
        Err(_) => T::default(),
    }
}

fn load_jsonl_docs(path: &Path, kind: DocKind) -> Vec<Doc> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    let mut docs: Vec<Doc> = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Doc>(line) {
            Ok(doc) => {
                if doc.kind() == kind {
                    docs.push(doc);
                } else {
                    tracing::warn!(
                        "{}:{} document kind {} does not match corpus {}",
                        path.display(),
                        line_no + 1,
                        doc.kind().as_str(),
                        kind.as_str()
                    );
                }
            }
            Err(err) => {
                tracing::warn!("{}:{} skipping malformed doc: {}", path.display(), line_no + 1, err);
            }
        }
    }
    docs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocMeta;

    #[test]
    fn docs_reload_on_mtime_change() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = MetadataCache::new(dir.path());
        let path = dir.path().join("glossary.jsonl");

        let doc = Doc::new("age: ANCHOR_AGE", DocMeta::Glossary { term: Some("age".into()) });
        std::fs::write(&path, format!("{}\n", serde_json::to_string(&doc).unwrap())).unwrap();
        assert_eq!(cache.docs(DocKind::Glossary).len(), 1);

        let second = Doc::new("los: OUTTIME - INTIME", DocMeta::Glossary { term: Some("los".into()) });
        let content = format!(
            "{}\n{}\n",
            serde_json::to_string(&doc).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
        std::fs::write(&path, content).unwrap();
        // Force a visible mtime difference on coarse-grained filesystems.
        let new_mtime = std::time::SystemTime::now() + std::time::Duration::from_secs(2);
        let file = std::fs::File::open(&path).unwrap();
        file.set_modified(new_mtime).unwrap();
        assert_eq!(cache.docs(DocKind::Glossary).len(), 2);
    }

    #[test]
    fn table_scope_falls_back_to_global() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = MetadataCache::new(dir.path());
        cache.save_table_scope(None, vec!["ADMISSIONS".into(), "PATIENTS".into()]).unwrap();
        cache.save_table_scope(Some("alice"), vec!["ICUSTAYS".into()]).unwrap();

        assert_eq!(cache.load_table_scope(Some("alice")), vec!["ICUSTAYS".to_string()]);
        assert_eq!(
            cache.load_table_scope(Some("bob")),
            vec!["ADMISSIONS".to_string(), "PATIENTS".to_string()]
        );
    }
}
