use std::sync::Arc;

use crate::config::Config;
use crate::models::{OneshotRequest, RunRequest};
use crate::services::agents::{Clarifier, Planner, SqlAgents, Translator};
use crate::services::audit::{AuditService, QueryStateStore};
use crate::services::events::EventLog;
use crate::services::metadata::MetadataCache;
use crate::services::oracle::{ExecutorPool, SqlExecutor};
use crate::services::orchestrator::Orchestrator;
use crate::services::postprocess::PostProcessor;
use crate::services::repair::LearnedFixStore;
use crate::services::retrieval::{HybridRetriever, LocalDocStore, NoopEmbedder};
use crate::tests::common::{
    ScriptedExecutor, ScriptedLlm, agent_sql_response, create_test_db, exec_error, ok_result,
};

struct Fixture {
    orchestrator: Orchestrator,
    learned: Arc<LearnedFixStore>,
    query_state: Arc<QueryStateStore>,
    executor: Arc<ScriptedExecutor>,
    _dir: tempfile::TempDir,
}

async fn fixture(llm: Arc<ScriptedLlm>, executor: Arc<ScriptedExecutor>) -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = Arc::new(Config::default());
    let cache = Arc::new(MetadataCache::new(dir.path()));
    let events = Arc::new(EventLog::new(dir.path().join("events.ndjson")));
    let learned = Arc::new(LearnedFixStore::new(
        dir.path().join("sql_error_repair_rules.json"),
        config.repair.max_rules,
    ));
    let retriever = Arc::new(HybridRetriever::new(
        Arc::clone(&cache),
        Arc::new(LocalDocStore::new(Arc::clone(&cache))),
        Arc::new(NoopEmbedder),
        config.rag.clone(),
    ));
    let postprocessor = Arc::new(PostProcessor::new(Arc::clone(&cache)));

    let executor_for_pool = Arc::clone(&executor);
    let pool = Arc::new(ExecutorPool::new(Box::new(move |_key| {
        Arc::clone(&executor_for_pool) as Arc<dyn SqlExecutor>
    })));

    let db = create_test_db().await;
    let query_state = Arc::new(QueryStateStore::new(db.clone()));
    let audit = Arc::new(AuditService::new(db.clone()));

    let orchestrator = Orchestrator::new(
        Arc::clone(&config),
        Clarifier::new(llm.clone(), &config.llm),
        Translator::new(llm.clone(), &config.llm),
        Planner::new(llm.clone(), &config.llm),
        SqlAgents::new(llm.clone(), &config.llm),
        retriever,
        postprocessor,
        Arc::clone(&pool),
        Arc::clone(&learned),
        Arc::clone(&cache),
        events,
        Arc::clone(&query_state),
        audit,
    );

    Fixture { orchestrator, learned, query_state, executor, _dir: dir }
}

const ICU_MORTALITY_SQL: &str = "SELECT EXTRACT(YEAR FROM I.INTIME) AS ICU_YEAR, \
    COUNT(DISTINCT CASE WHEN A.DEATHTIME BETWEEN I.INTIME AND I.OUTTIME THEN A.HADM_ID END) / \
    NULLIF(COUNT(DISTINCT A.HADM_ID), 0) AS MORTALITY_RATE \
    FROM ADMISSIONS A JOIN ICUSTAYS I ON A.HADM_ID = I.HADM_ID \
    WHERE I.INTIME >= DATE '2018-01-01' AND I.INTIME < DATE '2021-01-01' \
    GROUP BY EXTRACT(YEAR FROM I.INTIME)";

#[tokio::test]
async fn icu_yearly_mortality_runs_planner_and_keeps_death_window_semantics() {
    let planner_intent = serde_json::json!({
        "intent": {
            "cohort": "ICU patients",
            "metric": "mortality rate",
            "time": "2018-2020",
            "grain": "yearly",
            "comparison": "",
            "output_shape": "table",
            "filters": [],
            "intent_summary": "yearly ICU mortality 2018-2020"
        }
    })
    .to_string();

    let llm = ScriptedLlm::new(vec![
        // clarifier
        r#"{"need_clarification": false, "reason": "", "clarification_question": "", "options": [], "example_inputs": [], "refined_question": ""}"#,
        // translator
        "Yearly mortality rate of ICU patients admitted between 2018 and 2020",
        // planner
        &planner_intent,
        // engineer
        &agent_sql_response(ICU_MORTALITY_SQL),
        // expert review
        &agent_sql_response(ICU_MORTALITY_SQL),
    ]);
    let executor = ScriptedExecutor::new(vec![]);
    let fixture = fixture(llm.clone(), executor).await;

    let result = fixture
        .orchestrator
        .oneshot(OneshotRequest {
            question: "2018년부터 2020년까지 ICU 환자의 연도별 사망률".to_string(),
            user_name: Some("tester".to_string()),
            user_role: None,
            conversation: Vec::new(),
        })
        .await
        .expect("oneshot result");

    assert_eq!(result.mode, "advanced");
    assert!(result.planner_decision.activated, "{:?}", result.planner_decision);
    assert!(result.planner.is_some());
    assert!(result.question_en.is_some());

    let sql = result.final_sql.final_sql.to_uppercase();
    assert!(sql.contains("ICUSTAYS"));
    assert!(sql.contains("DEATHTIME BETWEEN"));
    assert!(sql.contains("EXTRACT(YEAR FROM"));
    assert!(!sql.contains("HOSPITAL_EXPIRE_FLAG"));
    assert!(result.final_sql.intent_alignment_issues.is_empty());
    assert!(result.policy.as_ref().map(|p| p.passed).unwrap_or(false));

    // The oneshot result is addressable by qid for /query/run.
    let stored = fixture.query_state.load(&result.qid).await.expect("stored query");
    assert_eq!(stored.sql.to_uppercase(), result.final_sql.final_sql.to_uppercase());
}

#[tokio::test]
async fn hypertension_question_returns_definition_clarification() {
    let llm = ScriptedLlm::new(vec![]);
    let executor = ScriptedExecutor::new(vec![]);
    let fixture = fixture(llm.clone(), executor).await;

    let result = fixture
        .orchestrator
        .oneshot(OneshotRequest {
            question: "고혈압 환자 수 알려줘".to_string(),
            user_name: None,
            user_role: None,
            conversation: Vec::new(),
        })
        .await
        .expect("oneshot result");

    assert_eq!(result.mode, "clarify");
    let clarification = result.clarification.expect("clarification block");
    assert!(clarification.need_clarification);
    assert!(
        clarification.clarification_question.contains("정의")
            || clarification.clarification_question.contains("기준"),
        "{}",
        clarification.clarification_question
    );
    for option in [
        "진단 코드 기반 (I10-I15)",
        "항고혈압제 복용 기준",
        "입실 전 병력(comorbidity)",
        "고혈압 위기 제외",
    ] {
        assert!(
            clarification.options.iter().any(|o| o == option),
            "missing option {}",
            option
        );
    }
    // The rule table answers without any LLM round-trip.
    assert_eq!(llm.call_count(), 0);
}

#[tokio::test]
async fn timeout_repair_strips_order_by_executes_and_learns() {
    let failed_sql =
        "SELECT L.SUBJECT_ID, L.VALUENUM FROM LABEVENTS L WHERE L.ITEMID = 50813 ORDER BY L.CHARTTIME";
    let llm = ScriptedLlm::new(vec![]);
    let executor = ScriptedExecutor::new(vec![
        exec_error("DPY-4024: call timeout of 180000 ms exceeded"),
        ok_result(42),
    ]);
    let fixture = fixture(llm, Arc::clone(&executor)).await;

    let response = fixture
        .orchestrator
        .run(RunRequest {
            qid: None,
            sql: Some(failed_sql.to_string()),
            user_ack: true,
            user_name: Some("tester".to_string()),
            user_role: None,
        })
        .await
        .expect("run response");

    assert!(response.repaired);
    assert!(response
        .repair_rules
        .contains(&"template_timeout_strip_order_by".to_string()));
    assert!(!response.final_sql.to_uppercase().contains("ORDER BY"));
    assert_eq!(response.row_count, 42);

    let executed = fixture.executor.executed_sql();
    assert_eq!(executed.len(), 2, "one failure, one repaired retry");

    // The fix is remembered under the timeout signature.
    let learned = fixture
        .learned
        .find(failed_sql, "DPY-4024: call timeout of 180000 ms exceeded")
        .expect("learned fix persisted");
    assert_eq!(learned.error_signature, "DPY-4024");
    assert_eq!(learned.success_count, 1);
}

#[tokio::test]
async fn run_requires_user_ack_and_some_sql() {
    let llm = ScriptedLlm::new(vec![]);
    let executor = ScriptedExecutor::new(vec![]);
    let fixture = fixture(llm, executor).await;

    let no_ack = fixture
        .orchestrator
        .run(RunRequest {
            qid: None,
            sql: Some("SELECT 1 FROM DUAL".to_string()),
            user_ack: false,
            user_name: None,
            user_role: None,
        })
        .await;
    assert!(no_ack.is_err());

    let nothing = fixture
        .orchestrator
        .run(RunRequest { qid: None, sql: None, user_ack: true, user_name: None, user_role: None })
        .await;
    assert!(nothing.is_err());
}

#[tokio::test]
async fn write_sql_is_blocked_before_execution() {
    let llm = ScriptedLlm::new(vec![]);
    let executor = ScriptedExecutor::new(vec![ok_result(1)]);
    let fixture = fixture(llm, Arc::clone(&executor)).await;

    let result = fixture
        .orchestrator
        .run(RunRequest {
            qid: None,
            sql: Some("DELETE FROM ADMISSIONS WHERE 1 = 1".to_string()),
            user_ack: true,
            user_name: None,
            user_role: None,
        })
        .await;
    assert!(result.is_err());
    assert!(fixture.executor.executed_sql().is_empty(), "executor must never see writes");
}
