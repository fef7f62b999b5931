use crate::services::repair::{
    LearnedFixStore, apply_sql_error_templates, error_signature, parse_sql_error,
};
use crate::utils::sql_text::sql_hash;

#[test]
fn timeout_repair_strips_order_by_and_learns_the_fix() {
    let failed = "SELECT L.SUBJECT_ID, L.VALUENUM FROM LABEVENTS L WHERE L.ITEMID = 50813 \
                  ORDER BY L.CHARTTIME";
    let error = "DPY-4024: call timeout of 180000 ms exceeded";

    // Template stage: ORDER BY goes away, no implicit ROWNUM appears.
    let (fixed, rules) = apply_sql_error_templates("젖산 수치 목록", failed, error);
    assert!(!fixed.to_uppercase().contains("ORDER BY"));
    assert!(!fixed.to_uppercase().contains("ROWNUM"));
    assert!(rules.contains(&"template_timeout_strip_order_by".to_string()));

    // Successful repair persists a learned fix keyed by the timeout code.
    let dir = tempfile::tempdir().unwrap();
    let store = LearnedFixStore::new(dir.path().join("rules.json"), 200);
    let stored = store.upsert(failed, &fixed, error, &rules).expect("stored");
    assert_eq!(stored.error_signature, "DPY-4024");
    assert_eq!(stored.failed_sql_hash, sql_hash(failed));

    // Next hit resolves from the store without templates.
    let found = store.find(failed, error).expect("learned fix");
    assert_eq!(found.fixed_sql, fixed);
}

#[test]
fn learned_fix_upsert_is_idempotent_per_key() {
    let dir = tempfile::tempdir().unwrap();
    let store = LearnedFixStore::new(dir.path().join("rules.json"), 200);
    let failed = "SELECT MEDICATION FROM PRESCRIPTIONS WHERE ROWNUM <= 10";
    let fixed = "SELECT DRUG FROM PRESCRIPTIONS WHERE ROWNUM <= 10";
    let error = r#"ORA-00904: "MEDICATION": invalid identifier"#;

    let first = store.upsert(failed, fixed, error, &[]).unwrap();
    let second = store.upsert(failed, fixed, error, &[]).unwrap();
    assert_eq!(first.id, second.id, "same key must update, not duplicate");
    assert_eq!(second.success_count, 2);

    // Exactly one record for the (hash, signature) pair.
    let third =
        store.upsert(failed, "SELECT DRUG, DRUG_TYPE FROM PRESCRIPTIONS WHERE ROWNUM <= 10", error, &[]);
    assert_eq!(third.unwrap().id, first.id);
}

#[test]
fn signature_falls_back_to_canonical_markers_then_message_prefix() {
    assert_eq!(error_signature("Table not allowed: ICUSTAYS, LABEVENTS"), "TABLE_NOT_ALLOWED");
    assert_eq!(error_signature("Join limit exceeded: 9/6"), "JOIN_LIMIT_EXCEEDED");
    assert_eq!(error_signature("WHERE clause required"), "WHERE_REQUIRED");
    let odd = error_signature("Something completely different happened here");
    assert_eq!(odd, "something completely different happened here");
}

#[test]
fn ora_00904_alias_column_repairs_apply_in_one_template_pass() {
    let failed = "SELECT D.LONG_TITLE, COUNT(*) FROM PROCEDUREEVENTS P \
                  JOIN D_ITEMS D ON P.ITEMID = D.ITEMID WHERE ROWNUM <= 50 GROUP BY D.LONG_TITLE";
    let (fixed, rules) = apply_sql_error_templates(
        "시술 항목별 건수",
        failed,
        r#"ORA-00904: "D"."LONG_TITLE": invalid identifier"#,
    );
    assert!(fixed.contains("D.LABEL"));
    assert!(rules.contains(&"template_00904_long_title_to_label".to_string()));
}

#[test]
fn parsed_error_detail_feeds_the_llm_repair_payload() {
    let parsed = parse_sql_error(
        "ORA-00979: not a GROUP BY expression",
        "SELECT GENDER, ANCHOR_AGE, COUNT(*) FROM PATIENTS GROUP BY GENDER",
    );
    assert_eq!(parsed.error_code, "ORA-00979");
    assert_eq!(parsed.select_items.len(), 3);
    assert_eq!(parsed.group_by_items, vec!["GENDER".to_string()]);
    let json = serde_json::to_value(&parsed).unwrap();
    assert!(json.get("select_items").is_some());
}
