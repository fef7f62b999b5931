use crate::services::policy::PolicyGate;
use crate::utils::sql_text::strip_literals_and_comments;

fn gate() -> PolicyGate {
    PolicyGate::new(6)
}

#[test]
fn count_star_without_where_passes_with_aggregate_message() {
    let report = gate().evaluate(
        "SELECT COUNT(*) FROM ADMISSIONS",
        Some("how many admissions"),
        &[],
    );
    assert!(report.passed, "{:?}", report.checks);
    let where_check = report
        .checks
        .iter()
        .find(|c| c.name == "WHERE rule")
        .expect("WHERE rule check present");
    assert_eq!(where_check.message, "Aggregate question: WHERE optional");
}

#[test]
fn group_by_tail_counts_as_bounded_shape() {
    let sql = "SELECT ADMISSION_TYPE, COUNT(*) FROM ADMISSIONS GROUP BY ADMISSION_TYPE";
    let report = gate().evaluate(sql, Some("입원 유형별 건수"), &[]);
    assert!(report.passed);
}

#[test]
fn where_less_non_aggregate_without_row_cap_is_rejected() {
    let report = gate().evaluate(
        "SELECT SUBJECT_ID, ADMITTIME FROM ADMISSIONS",
        Some("입원 목록 보여줘"),
        &[],
    );
    assert!(!report.passed);
    let failed = report.checks.iter().find(|c| !c.passed).unwrap();
    assert_eq!(failed.name, "WHERE rule");
}

#[test]
fn rownum_cap_exempts_where_requirement() {
    let report = gate().evaluate(
        "SELECT SUBJECT_ID FROM ADMISSIONS WHERE ROWNUM <= 10",
        None,
        &[],
    );
    assert!(report.passed);
}

#[test]
fn write_verbs_in_literals_and_comments_do_not_block() {
    let sql = "SELECT COUNT(*) FROM NOTES /* delete later */ WHERE TEXT LIKE '%UPDATE%'";
    let stripped = strip_literals_and_comments(sql);
    assert!(!stripped.to_lowercase().contains("update"));
    assert!(!stripped.to_lowercase().contains("delete"));

    let report = gate().evaluate(sql, None, &[]);
    assert!(report.passed, "{:?}", report.checks);
}

#[test]
fn write_statement_is_forbidden() {
    for sql in [
        "DELETE FROM ADMISSIONS WHERE 1 = 1",
        "UPDATE PATIENTS SET GENDER = 'F' WHERE 1 = 1",
        "INSERT INTO ADMISSIONS VALUES (1)",
        "TRUNCATE TABLE LABEVENTS",
    ] {
        let report = gate().evaluate(sql, None, &[]);
        assert!(!report.passed, "write statement must fail: {}", sql);
    }
}

#[test]
fn with_must_contain_select() {
    let report = gate().evaluate("WITH C AS (VALUES 1)", None, &[]);
    assert!(!report.passed);
}

#[test]
fn table_scope_enforced_with_cte_and_dual_allowed() {
    let scope = vec!["ADMISSIONS".to_string(), "PATIENTS".to_string()];
    let good = "WITH COHORT AS (SELECT HADM_ID FROM ADMISSIONS WHERE ROWNUM <= 100) \
                SELECT COUNT(*) FROM COHORT, DUAL";
    let report = gate().evaluate(good, None, &scope);
    assert!(report.passed, "{:?}", report.checks);

    let bad = "SELECT COUNT(*) FROM ICUSTAYS";
    let report = gate().evaluate(bad, Some("how many stays"), &scope);
    assert!(!report.passed);
    assert!(report.deferred, "scope violations defer for the repair loop");
    let failed = report.checks.iter().find(|c| !c.passed).unwrap();
    assert!(failed.message.contains("ICUSTAYS"));
}

#[test]
fn schema_qualified_scope_tables_resolve() {
    let scope = vec!["ADMISSIONS".to_string()];
    let sql = "SELECT COUNT(*) FROM MIMICIV.ADMISSIONS";
    let report = gate().evaluate(sql, Some("건수 통계"), &scope);
    assert!(report.passed, "{:?}", report.checks);
}
