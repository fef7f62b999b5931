use std::sync::Arc;

use crate::config::RagConfig;
use crate::models::{Doc, DocMeta};
use crate::services::metadata::MetadataCache;
use crate::services::retrieval::{HybridRetriever, LocalDocStore, NoopEmbedder};
use crate::utils::text::{normalize, tokenize};

fn write_jsonl(dir: &std::path::Path, file: &str, docs: &[Doc]) {
    let lines: Vec<String> =
        docs.iter().map(|d| serde_json::to_string(d).unwrap()).collect();
    std::fs::write(dir.join(file), lines.join("\n") + "\n").unwrap();
}

fn retriever(dir: &std::path::Path) -> HybridRetriever {
    let cache = Arc::new(MetadataCache::new(dir));
    HybridRetriever::new(
        Arc::clone(&cache),
        Arc::new(LocalDocStore::new(cache)),
        Arc::new(NoopEmbedder),
        RagConfig::default(),
    )
}

#[test]
fn retrieval_token_normalization_is_idempotent() {
    for text in ["ICU 환자의 연도별 사망률", "  Mixed   CASE Text  ", "고혈압  환자"] {
        assert_eq!(tokenize(&normalize(text)), tokenize(&normalize(&normalize(text))));
    }
}

#[tokio::test]
async fn age_questions_prefer_anchor_age_docs() {
    let dir = tempfile::tempdir().unwrap();
    let age_doc = Doc::new(
        "연령 분석은 ANCHOR_AGE 사용",
        DocMeta::Glossary { term: Some("age".into()) },
    );
    let year_doc = Doc::new(
        "연령 버킷 ANCHOR_YEAR_GROUP 설명",
        DocMeta::Glossary { term: Some("year_group".into()) },
    );
    write_jsonl(dir.path(), "glossary.jsonl", &[year_doc, age_doc]);

    let retriever = retriever(dir.path());
    let output = retriever.retrieve("환자 연령 분포", None).await;
    let glossary = &output.context.glossary;
    assert!(glossary.len() >= 2, "{:?}", glossary);
    assert!(
        glossary[0].text.contains("ANCHOR_AGE"),
        "anchor_age doc must outrank anchor_year_group: {:?}",
        glossary
    );
    assert!(glossary[0].score.unwrap_or(0.0) > glossary[1].score.unwrap_or(0.0));
}

#[tokio::test]
async fn first_icu_examples_suppressed_unless_asked() {
    let dir = tempfile::tempdir().unwrap();
    let first_icu = Doc::new(
        "첫 ICU 입실 환자 수 예시: RN_FIRST_ICU = 1 필터 사용",
        DocMeta::Example { name: Some("first_icu_count".into()) },
    );
    let plain = Doc::new(
        "ICU 환자 수 예시: SELECT COUNT(*) FROM ICUSTAYS",
        DocMeta::Example { name: Some("icu_count".into()) },
    );
    write_jsonl(dir.path(), "example.jsonl", &[first_icu, plain]);

    let retriever = retriever(dir.path());

    let output = retriever.retrieve("ICU 환자 수", None).await;
    assert!(
        output.context.examples.iter().all(|e| !e.text.contains("RN_FIRST_ICU")),
        "first-ICU example must be suppressed: {:?}",
        output.context.examples
    );
    assert!(!output.context.examples.is_empty());

    let output = retriever.retrieve("첫 ICU 입실 환자 수", None).await;
    assert!(
        output.context.examples.iter().any(|e| e.text.contains("RN_FIRST_ICU")),
        "explicit first-ICU question keeps the example"
    );
}

#[tokio::test]
async fn table_scope_filters_and_injects_schema_docs() {
    let dir = tempfile::tempdir().unwrap();
    let admissions = Doc::new(
        "ADMISSIONS: 입원 정보 테이블 (HADM_ID, ADMITTIME, DISCHTIME)",
        DocMeta::Schema { table: "ADMISSIONS".into() },
    );
    let patients = Doc::new(
        "PATIENTS: 환자 속성 테이블 (SUBJECT_ID, GENDER, ANCHOR_AGE)",
        DocMeta::Schema { table: "PATIENTS".into() },
    );
    write_jsonl(dir.path(), "schema.jsonl", &[admissions, patients]);

    let catalog = serde_json::json!({
        "owner": "MIMICIV",
        "requested_owner": "MIMICIV",
        "owners": ["MIMICIV"],
        "tables": {
            "ADMISSIONS": {"owner": "MIMICIV", "columns": [{"name": "HADM_ID", "type": "NUMBER", "nullable": false}], "primary_keys": ["HADM_ID"]},
            "ICUSTAYS": {"owner": "MIMICIV", "columns": [{"name": "STAY_ID", "type": "NUMBER", "nullable": false}], "primary_keys": ["STAY_ID"]},
            "PATIENTS": {"owner": "MIMICIV", "columns": [], "primary_keys": []},
            "LABEVENTS": {"owner": "MIMICIV", "columns": [], "primary_keys": []}
        }
    });
    std::fs::write(dir.path().join("schema_catalog.json"), catalog.to_string()).unwrap();
    std::fs::write(
        dir.path().join("table_scope.json"),
        serde_json::json!({"global": ["ADMISSIONS", "ICUSTAYS"], "users": {}}).to_string(),
    )
    .unwrap();

    let retriever = retriever(dir.path());
    let output = retriever.retrieve("입원 환자 수", None).await;

    assert!(
        output.context.schemas.iter().all(|s| !s.text.starts_with("PATIENTS:")),
        "out-of-scope schema docs must be filtered: {:?}",
        output.context.schemas
    );
    assert!(
        output.context.schemas.iter().any(|s| s.text.contains("ADMISSIONS")),
        "{:?}",
        output.context.schemas
    );
    assert!(
        output.context.schemas.iter().any(|s| s.text.contains("TABLE ICUSTAYS")),
        "missing scoped table must be injected from the catalog: {:?}",
        output.context.schemas
    );
    assert_eq!(output.scope.scope_size, 2);
    assert_eq!(output.scope.total_tables, 4);
}

#[tokio::test]
async fn admission_type_questions_get_a_value_hint() {
    let dir = tempfile::tempdir().unwrap();
    let retriever = retriever(dir.path());
    let output = retriever.retrieve("응급 입원 유형별 환자 수", None).await;
    assert!(
        output
            .context
            .schemas
            .iter()
            .any(|s| s.text.contains("ADMISSIONS.ADMISSION_TYPE")),
        "admission-type hint doc expected: {:?}",
        output.context.schemas
    );
    assert!(output.notes.iter().any(|n| n == "admission_type_hint_injected"));
}

#[tokio::test]
async fn diagnosis_terms_produce_icd_prefix_hints() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("diagnosis_map_terms.json"),
        serde_json::json!([{"term": "고혈압", "prefixes": ["I10", "I11"]}]).to_string(),
    )
    .unwrap();

    let retriever = retriever(dir.path());
    let output = retriever.retrieve("고혈압 환자 수", None).await;
    assert!(
        output.context.glossary.iter().any(|g| g.text.contains("I10%")),
        "{:?}",
        output.context.glossary
    );
}
