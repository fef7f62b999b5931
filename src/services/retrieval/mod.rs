//! Hybrid lexical + dense retrieval across the typed corpora.
//!
//! Default mode is `bm25_then_rerank`: lexical recall anchors the candidate
//! pool and dense similarity reranks inside it. `hybrid_legacy` scores the
//! union of both candidate sets. Dictionary matchers contribute synthetic
//! hint documents on top of corpus hits.

pub mod bm25;
pub mod budget;
pub mod column_value;
pub mod diagnosis_map;
pub mod label_intent;
pub mod store;

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::config::RagConfig;
use crate::models::{ContextItem, Doc, DocKind, DocMeta, RetrievalContext};
use crate::services::metadata::MetadataCache;
use crate::utils::text::lexical_overlap;

pub use budget::{ScopeProfile, TokenEstimator, WhitespaceEstimator, trim_context_to_budget};
pub use column_value::ColumnValueMatcher;
pub use diagnosis_map::{IcdDomain, IcdTermMapper, IcdTermMatch, icd_version_for_prefix};
pub use label_intent::LabelIntentMatcher;
pub use store::{Embedder, LocalDocStore, NoopEmbedder, VectorStore};

const MIN_LEXICAL_OVERLAP: f64 = 0.08;
const MIN_LEXICAL_OVERLAP_COLUMN_VALUE: f64 = 0.10;
const MIN_LEXICAL_OVERLAP_SERVICE_VALUE: f64 = 0.04;
const AGE_INTENT_YEAR_GROUP_PENALTY: f64 = 0.55;
const AGE_INTENT_ANCHOR_AGE_BOOST: f64 = 1.15;

static AGE_SEMANTIC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(연령대|나이대|연령|나이|나잇대|aged?\b|age\s*(group|band|range)?\b)")
        .expect("valid regex")
});
static YEAR_SEMANTIC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(연도|년도|연도별|년별|year|yearly|annual|anchor[_\s]*year)").expect("valid regex")
});
static LACTATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(lactate|lactic\s*acid|젖산|락테이트)").expect("valid regex"));
static FIRST_ICU_QUERY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(first\s+icu|first[-\s]*stay|initial\s+icu|index\s+icu|첫\s*icu|첫번째\s*icu|최초\s*icu|처음\s*icu|첫\s*중환자실|최초\s*중환자실|처음\s*중환자실)",
    )
    .expect("valid regex")
});
static FIRST_ICU_DOC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(first_icu|rn_first_icu|row_number\s*\(\s*\)\s*over\s*\(\s*partition\s+by\s+[a-z0-9_\.]*subject_id\s+order\s+by\s+[a-z0-9_\.]*intime|first\s+icu|first[-\s]*stay|첫\s*icu|첫\s*중환자실|최초\s*icu|최초\s*중환자실|처음\s*icu|처음\s*중환자실)",
    )
    .expect("valid regex")
});
static ICU_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)(중환자실|\bicu\b)").expect("valid regex"));
static MORTALITY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(사망|mortality|death|deceased|expire)").expect("valid regex"));
static SERVICE_INTENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(진료과|서비스|과별|부서|department|service|curr_service|prev_service)")
        .expect("valid regex")
});
static ADMISSION_TYPE_INTENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(입원\s*유형|입원유형|admission\s*type|admission_type|emergency|urgent|elective)")
        .expect("valid regex")
});
static ANCHOR_YEAR_GROUP_TEXT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)anchor[_\s]*year[_\s]*group").expect("valid regex"));
static ANCHOR_AGE_TEXT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)anchor[_\s]*age").expect("valid regex"));
static HOSPITAL_EXPIRE_TEXT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)hospital_expire_flag").expect("valid regex"));
static DEATH_ALIGNMENT_TEXT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)deathtime[\s\S]*intime[\s\S]*outtime").expect("valid regex"));

pub fn query_prefers_anchor_age(question: &str) -> bool {
    AGE_SEMANTIC_RE.is_match(question) && !YEAR_SEMANTIC_RE.is_match(question)
}

fn is_anchor_year_group_only(text: &str) -> bool {
    ANCHOR_YEAR_GROUP_TEXT_RE.is_match(text) && !ANCHOR_AGE_TEXT_RE.is_match(text)
}

fn is_anchor_age_only(text: &str) -> bool {
    ANCHOR_AGE_TEXT_RE.is_match(text) && !ANCHOR_YEAR_GROUP_TEXT_RE.is_match(text)
}

fn is_hospital_expire_proxy(text: &str) -> bool {
    HOSPITAL_EXPIRE_TEXT_RE.is_match(text) && !DEATH_ALIGNMENT_TEXT_RE.is_match(text)
}

#[derive(Debug, Clone)]
pub struct RetrievedDoc {
    pub doc: Doc,
    pub score: f64,
}

/// Full retrieval output handed to the budgeter and the agents.
#[derive(Debug, Clone, Default)]
pub struct RetrievalOutput {
    pub context: RetrievalContext,
    /// Metadata tags surfaced by dictionary matchers.
    pub notes: Vec<String>,
    pub scope: ScopeProfile,
}

pub struct HybridRetriever {
    cache: Arc<MetadataCache>,
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    column_matcher: ColumnValueMatcher,
    icd_mapper: IcdTermMapper,
    label_matcher: LabelIntentMatcher,
    config: RagConfig,
}

impl HybridRetriever {
    pub fn new(
        cache: Arc<MetadataCache>,
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        config: RagConfig,
    ) -> Self {
        Self {
            column_matcher: ColumnValueMatcher::new(Arc::clone(&cache)),
            icd_mapper: IcdTermMapper::new(Arc::clone(&cache)),
            label_matcher: LabelIntentMatcher::new(Arc::clone(&cache)),
            cache,
            store,
            embedder,
            config,
        }
    }

    /// Retrieve the typed context for one question under the user's scope.
    pub async fn retrieve(&self, question: &str, user: Option<&str>) -> RetrievalOutput {
        let embedding = match self.embedder.embed(question).await {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!("Query embedding unavailable, lexical-only retrieval: {}", err);
                None
            }
        };

        let mut schemas =
            self.retrieve_kind(question, DocKind::Schema, embedding.as_deref()).await;
        schemas.extend(
            self.retrieve_kind(question, DocKind::TableProfile, embedding.as_deref())
                .await,
        );
        schemas.extend(
            self.retrieve_kind(question, DocKind::ColumnValue, embedding.as_deref())
                .await,
        );
        let mut examples =
            self.retrieve_kind(question, DocKind::Example, embedding.as_deref()).await;
        let mut templates =
            self.retrieve_kind(question, DocKind::Template, embedding.as_deref()).await;
        let mut glossary =
            self.retrieve_kind(question, DocKind::Glossary, embedding.as_deref()).await;
        for kind in [DocKind::DiagnosisMap, DocKind::ProcedureMap, DocKind::LabelIntent] {
            glossary.extend(self.retrieve_kind(question, kind, embedding.as_deref()).await);
        }

        // Intent suppression: drop niche example/template/glossary docs the
        // question did not ask for, keeping the originals when everything
        // would be filtered out.
        if !LACTATE_RE.is_match(question) {
            suppress(&mut examples, |d| LACTATE_RE.is_match(&d.doc.text));
        }
        if !FIRST_ICU_QUERY_RE.is_match(question) {
            suppress(&mut examples, |d| FIRST_ICU_DOC_RE.is_match(&d.doc.text));
            suppress(&mut templates, |d| FIRST_ICU_DOC_RE.is_match(&d.doc.text));
            suppress(&mut glossary, |d| FIRST_ICU_DOC_RE.is_match(&d.doc.text));
        }
        if ICU_RE.is_match(question) && MORTALITY_RE.is_match(question) {
            for pool in [&mut examples, &mut templates, &mut glossary] {
                suppress(pool, |d| is_hospital_expire_proxy(&d.doc.text));
            }
        }

        // Age-semantic bias, applied to every role.
        if query_prefers_anchor_age(question) {
            for pool in [&mut schemas, &mut examples, &mut templates, &mut glossary] {
                for hit in pool.iter_mut() {
                    if is_anchor_year_group_only(&hit.doc.text) {
                        hit.score *= AGE_INTENT_YEAR_GROUP_PENALTY;
                    } else if is_anchor_age_only(&hit.doc.text) {
                        hit.score *= AGE_INTENT_ANCHOR_AGE_BOOST;
                    }
                }
                pool.sort_by(|a, b| {
                    b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal)
                });
            }
        }

        let mut notes: Vec<String> = Vec::new();

        // Dictionary matchers.
        let column_matches = self.column_matcher.match_question(question);
        let has_service_value_hit = column_matches.iter().any(|m| {
            matches!(&m.doc.metadata, DocMeta::ColumnValue { table, .. } if table.eq_ignore_ascii_case("SERVICES"))
        });
        let has_admission_type_hit = column_matches.iter().any(|m| {
            matches!(&m.doc.metadata, DocMeta::ColumnValue { column, .. } if column.eq_ignore_ascii_case("ADMISSION_TYPE"))
        });
        let service_value_intent = SERVICE_INTENT_RE.is_match(question);
        let min_cv_overlap = if service_value_intent {
            MIN_LEXICAL_OVERLAP_SERVICE_VALUE
        } else {
            MIN_LEXICAL_OVERLAP_COLUMN_VALUE
        };
        for m in column_matches {
            if lexical_overlap(question, &m.doc.text) < min_cv_overlap && m.score < 28.0 {
                continue;
            }
            notes.extend(m.notes);
            schemas.push(RetrievedDoc { doc: m.doc, score: m.score });
        }

        for m in self.icd_mapper.match_question(question) {
            glossary.push(RetrievedDoc { doc: m.doc, score: 30.0 });
        }
        for m in self.label_matcher.match_question(question) {
            glossary.push(RetrievedDoc { doc: m.doc, score: m.score });
        }

        // Service/admission-type intent: inject a synthetic column hint when
        // no value-catalog match already anchors the right column.
        if service_value_intent && !has_service_value_hit && !ADMISSION_TYPE_INTENT_RE.is_match(question)
        {
            notes.push("service_intent_hint_injected".to_string());
            schemas.push(RetrievedDoc {
                doc: Doc::new(
                    "Service/department questions use SERVICES.CURR_SERVICE (join via HADM_ID), not diagnosis or procedure tables",
                    DocMeta::ColumnValue { table: "SERVICES".into(), column: "CURR_SERVICE".into() },
                ),
                score: 25.0,
            });
        }
        if ADMISSION_TYPE_INTENT_RE.is_match(question) && !has_admission_type_hit {
            notes.push("admission_type_hint_injected".to_string());
            schemas.push(RetrievedDoc {
                doc: Doc::new(
                    "Admission-type questions use ADMISSIONS.ADMISSION_TYPE with values EMERGENCY, URGENT, ELECTIVE",
                    DocMeta::ColumnValue { table: "ADMISSIONS".into(), column: "ADMISSION_TYPE".into() },
                ),
                score: 25.0,
            });
        }

        // Table-scope application.
        let scope_tables = self.cache.load_table_scope(user);
        let scope = ScopeProfile {
            scope_size: scope_tables.len(),
            total_tables: self.cache.schema_table_count(),
        };
        if !scope_tables.is_empty() && !self.cache.scope_is_effectively_all(&scope_tables) {
            let allowed: HashSet<String> =
                scope_tables.iter().map(|t| t.to_uppercase()).collect();
            schemas.retain(|hit| match hit.doc.metadata.table() {
                Some(table) => allowed.contains(&table.to_uppercase()),
                None => true,
            });
            let present: HashSet<String> = schemas
                .iter()
                .filter_map(|hit| hit.doc.metadata.table().map(|t| t.to_uppercase()))
                .collect();
            let catalog = self.cache.schema_catalog();
            for table in &scope_tables {
                let upper = table.to_uppercase();
                if present.contains(&upper) {
                    continue;
                }
                if let Some((name, info)) =
                    catalog.tables.iter().find(|(name, _)| name.to_uppercase() == upper)
                {
                    let columns = info
                        .columns
                        .iter()
                        .map(|c| format!("{} {}", c.name, c.data_type))
                        .collect::<Vec<_>>()
                        .join(", ");
                    schemas.push(RetrievedDoc {
                        doc: Doc::new(
                            format!("TABLE {} ({})", name, columns),
                            DocMeta::Schema { table: name.clone() },
                        ),
                        score: 5.0,
                    });
                }
            }
        }

        RetrievalOutput {
            context: RetrievalContext {
                schemas: to_items(schemas),
                examples: to_items(examples),
                templates: to_items(templates),
                glossary: to_items(glossary),
            },
            notes,
            scope,
        }
    }

    async fn retrieve_kind(
        &self,
        question: &str,
        kind: DocKind,
        embedding: Option<&[f32]>,
    ) -> Vec<RetrievedDoc> {
        let bm25_cap = if kind == DocKind::ColumnValue {
            self.config.bm25_max_docs.max(2500)
        } else {
            self.config.bm25_max_docs
        };
        let corpus = match self.store.list_documents(Some(kind), bm25_cap).await {
            Ok(docs) => docs,
            Err(err) => {
                // Infrastructure fallback: the local JSONL corpus always works.
                tracing::warn!("Doc store unavailable for {}: {}; using local corpus", kind.as_str(), err);
                self.cache.docs(kind).as_ref().clone()
            }
        };
        if corpus.is_empty() {
            return Vec::new();
        }

        let pairs: Vec<(String, String)> =
            corpus.iter().map(|d| (d.id.clone(), d.text.clone())).collect();
        let bm25_scores = bm25::score(question, &pairs);

        let mut dense_scores: HashMap<String, f64> = HashMap::new();
        if self.config.hybrid_enabled {
            if let Some(embedding) = embedding {
                let k = self.config.dense_candidates.max(self.config.top_k);
                match self.store.vector_search(embedding, k, Some(kind)).await {
                    Ok(hits) => {
                        let max = hits.iter().map(|(_, s)| *s).fold(0.0_f64, f64::max);
                        for (doc, score) in hits {
                            let normalized = if max > 0.0 { score / max } else { 0.0 };
                            dense_scores.insert(doc.id, normalized);
                        }
                    }
                    Err(err) => {
                        tracing::warn!("Vector search failed for {}: {}", kind.as_str(), err);
                    }
                }
            }
        }

        // bm25_then_rerank anchors the pool on lexical recall: dense scores
        // only matter for docs BM25 saw or the dense top slice itself.
        let candidate_ids: HashSet<String> = match self.config.retrieval_mode.as_str() {
            "hybrid_legacy" => bm25_scores
                .keys()
                .chain(dense_scores.keys())
                .cloned()
                .collect(),
            _ => {
                let mut ids: HashSet<String> = bm25_scores.keys().cloned().collect();
                let mut top_dense: Vec<(&String, &f64)> = dense_scores.iter().collect();
                top_dense.sort_by(|a, b| b.1.partial_cmp(a.1).unwrap_or(std::cmp::Ordering::Equal));
                ids.extend(top_dense.iter().take(self.config.top_k).map(|(id, _)| (*id).clone()));
                ids
            }
        };

        let (w_vec, w_bm25, w_overlap) = if kind.is_dictionary() {
            (0.55, 0.35, 0.10)
        } else {
            (0.50, 0.40, 0.10)
        };

        let mut hits: Vec<RetrievedDoc> = Vec::new();
        for doc in corpus {
            if !candidate_ids.contains(&doc.id) {
                continue;
            }
            let overlap = lexical_overlap(question, &doc.text);
            if overlap < MIN_LEXICAL_OVERLAP && !dense_scores.contains_key(&doc.id) {
                continue;
            }
            let score = w_vec * dense_scores.get(&doc.id).copied().unwrap_or(0.0)
                + w_bm25 * bm25_scores.get(&doc.id).copied().unwrap_or(0.0)
                + w_overlap * overlap;
            if score <= 0.0 {
                continue;
            }
            hits.push(RetrievedDoc { doc, score });
        }
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(self.config.top_k);
        hits
    }
}

fn suppress<F: Fn(&RetrievedDoc) -> bool>(pool: &mut Vec<RetrievedDoc>, predicate: F) {
    let filtered: Vec<RetrievedDoc> =
        pool.iter().filter(|d| !predicate(d)).cloned().collect();
    // Keep the original hits as fallback when everything would be dropped.
    if !filtered.is_empty() || pool.is_empty() {
        *pool = filtered;
    }
}

fn to_items(hits: Vec<RetrievedDoc>) -> Vec<ContextItem> {
    hits.into_iter()
        .map(|hit| ContextItem {
            text: hit.doc.text,
            score: Some(hit.score),
            source: hit.doc.metadata.kind().as_str().to_string(),
        })
        .collect()
}
