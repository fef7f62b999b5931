//! Core A pipeline: clarifier -> translator -> risk -> retrieval -> budget ->
//! planner -> engineer -> expert -> post-process -> intent guard -> policy,
//! plus the execute-and-repair loop behind `/query/run`.

use std::sync::Arc;
use std::time::Instant;

use serde_json::json;

use crate::config::Config;
use crate::models::{
    FinalSql, OneshotRequest, OrchestratorResult, PlannerIntent, RetrievalContext, RunRequest,
    RunResponse,
};
use crate::services::agents::{
    Clarifier, Planner, SqlAgents, Translator, build_default_scope, decide_planner_usage,
    inject_followup_context, should_apply_expert_review, synthesize_age_hint_intent,
};
use crate::services::audit::{AuditService, QueryStateStore};
use crate::services::events::EventLog;
use crate::services::intent_guard::{detect_intent_alignment_issues, enforce_intent_alignment};
use crate::services::metadata::MetadataCache;
use crate::services::oracle::{ExecOptions, ExecutorPool, effective_timeout_ms};
use crate::services::policy::{PolicyGate, violation_error};
use crate::services::postprocess::{PostProcessor, Profile};
use crate::services::repair::{
    LearnedFixStore, apply_sql_error_templates, parse_sql_error,
};
use crate::services::retrieval::{HybridRetriever, WhitespaceEstimator, trim_context_to_budget};
use crate::services::risk;
use crate::utils::text::contains_korean;
use crate::utils::{ApiError, ApiResult};

pub struct Orchestrator {
    config: Arc<Config>,
    clarifier: Clarifier,
    translator: Translator,
    planner: Planner,
    sql_agents: SqlAgents,
    retriever: Arc<HybridRetriever>,
    postprocessor: Arc<PostProcessor>,
    policy: PolicyGate,
    pool: Arc<ExecutorPool>,
    learned: Arc<LearnedFixStore>,
    cache: Arc<MetadataCache>,
    events: Arc<EventLog>,
    query_state: Arc<QueryStateStore>,
    audit: Arc<AuditService>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        clarifier: Clarifier,
        translator: Translator,
        planner: Planner,
        sql_agents: SqlAgents,
        retriever: Arc<HybridRetriever>,
        postprocessor: Arc<PostProcessor>,
        pool: Arc<ExecutorPool>,
        learned: Arc<LearnedFixStore>,
        cache: Arc<MetadataCache>,
        events: Arc<EventLog>,
        query_state: Arc<QueryStateStore>,
        audit: Arc<AuditService>,
    ) -> Self {
        let policy = PolicyGate::new(config.policy.max_joins);
        Self {
            config,
            clarifier,
            translator,
            planner,
            sql_agents,
            retriever,
            postprocessor,
            policy,
            pool,
            learned,
            cache,
            events,
            query_state,
            audit,
        }
    }

    /// One full oneshot pass: question in, final SQL (or clarification) out.
    /// Nothing is executed here; `/query/run` does that by qid.
    pub async fn oneshot(&self, request: OneshotRequest) -> ApiResult<OrchestratorResult> {
        let raw_question = request.question.trim().to_string();
        if raw_question.is_empty() {
            return Err(ApiError::invalid_data("question must not be empty"));
        }
        let request_id = uuid::Uuid::new_v4().to_string();
        let qid = uuid::Uuid::new_v4().simple().to_string();
        let user = request.user_name.as_deref();
        self.events.emit(
            "oneshot.start",
            json!({"request_id": &request_id, "qid": &qid, "user": user}),
        );

        // Follow-up questions inherit the previous question's constraints.
        let mut question = inject_followup_context(&raw_question, &request.conversation);

        // Stage 1: clarifier.
        let clarification = self.clarifier.evaluate(&question, &request.conversation).await;
        if clarification.need_clarification {
            self.events.emit(
                "oneshot.clarify",
                json!({"request_id": &request_id, "reason": &clarification.reason}),
            );
            return Ok(OrchestratorResult {
                qid,
                question: raw_question,
                question_en: None,
                planner: None,
                planner_decision: Default::default(),
                risk: risk::classify(&question),
                context: RetrievalContext::default(),
                draft: String::new(),
                final_sql: FinalSql::default(),
                policy: None,
                clarification: Some(clarification),
                mode: "clarify".to_string(),
                assumptions: Vec::new(),
                request_id,
            });
        }
        if !clarification.refined_question.trim().is_empty() {
            question = clarification.refined_question.trim().to_string();
        }

        // Optional default-scope autofill; every injected default is surfaced.
        let mut assumptions = Vec::new();
        if self.config.oneshot.default_scope_autofill_enabled {
            let (refined, injected) = build_default_scope(&question, &Default::default());
            if !injected.is_empty() {
                self.events.emit(
                    "oneshot.default_scope_autofill",
                    json!({"request_id": &request_id, "assumptions": injected.len()}),
                );
                question = refined;
                assumptions = injected;
            }
        }

        // Demo cache: curated questions skip every generation stage,
        // including translation.
        if let Some(cached_sql) = self.cache.demo_cache_lookup(&question) {
            self.events.emit(
                "oneshot.demo_cache_hit",
                json!({"request_id": &request_id, "qid": &qid}),
            );
            let risk_info = risk::classify(&question);
            let scope_tables = self.cache.load_table_scope(user);
            let effective_scope = if self.cache.scope_is_effectively_all(&scope_tables) {
                Vec::new()
            } else {
                scope_tables
            };
            let policy_report =
                self.policy.evaluate(&cached_sql, Some(&question), &effective_scope);
            self.query_state.save(&qid, &question, &cached_sql, user).await?;
            return Ok(OrchestratorResult {
                qid,
                question: raw_question,
                question_en: None,
                planner: None,
                planner_decision: Default::default(),
                risk: risk_info,
                context: RetrievalContext::default(),
                draft: cached_sql.clone(),
                final_sql: FinalSql { final_sql: cached_sql, ..Default::default() },
                policy: Some(policy_report),
                clarification: None,
                mode: "demo".to_string(),
                assumptions,
                request_id,
            });
        }

        // Stage 2: translation, Korean questions only.
        let question_en = if self.config.oneshot.translate_ko_to_en && contains_korean(&question) {
            self.translator.translate(&question).await.map(|(text, _usage)| text)
        } else {
            None
        };

        // Stage 3: risk scoring over both language forms.
        let risk_text = match &question_en {
            Some(en) => format!("{} {}", question, en),
            None => question.clone(),
        };
        let risk_info = risk::classify(&risk_text);

        // Stage 4/5: retrieval + context budget.
        let retrieval = self.retriever.retrieve(&risk_text, user).await;
        let scope = retrieval.scope;
        let estimator = WhitespaceEstimator;
        let context = trim_context_to_budget(
            &estimator,
            retrieval.context,
            self.config.llm.context_token_budget,
            scope,
        );
        let context_text = context.as_prompt_text();

        // Stage 6: planner gate.
        let planner_decision = decide_planner_usage(
            &self.config.planner,
            &question,
            question_en.as_deref(),
            &risk_info,
        );
        let mut planner_intent: Option<PlannerIntent> = None;
        if planner_decision.activated {
            planner_intent =
                self.planner.plan(&question, question_en.as_deref(), &context_text).await;
        }
        if planner_intent.is_none() {
            // Planner skipped (or failed): the age hint still has to bind SQL
            // generation to ANCHOR_AGE.
            planner_intent = synthesize_age_hint_intent(&question, question_en.as_deref());
        }

        // Stage 7: engineer, with bounded retries on generation failures.
        let mut draft = None;
        let mut last_error: Option<ApiError> = None;
        for attempt in 0..self.config.oneshot.max_retry_attempts.max(1) {
            match self
                .sql_agents
                .engineer(&question, question_en.as_deref(), &context_text, planner_intent.as_ref())
                .await
            {
                Ok(result) => {
                    draft = Some(result);
                    break;
                }
                Err(err) => {
                    tracing::warn!("Engineer attempt {} failed: {}", attempt + 1, err);
                    last_error = Some(err);
                }
            }
        }
        let draft = match draft {
            Some(draft) => draft,
            None => {
                return Err(last_error
                    .unwrap_or_else(|| ApiError::generation_failed("engineer produced no SQL")));
            }
        };
        let draft_sql = draft.final_sql.clone();
        let mut final_sql = draft_sql.clone();

        // Stage 8: expert review under risk pressure.
        let mut expert_ran = false;
        if should_apply_expert_review(&self.config.expert, &risk_info) {
            match self
                .sql_agents
                .expert_review(&question, &final_sql, &context_text, planner_intent.as_ref(), &[])
                .await
            {
                Ok(revised) => {
                    expert_ran = true;
                    final_sql = revised.final_sql;
                }
                Err(err) => tracing::warn!("Expert review failed, keeping draft: {}", err),
            }
        }

        // Stage 9: deterministic post-processing. Failures never abort.
        let mut postprocess_rules = retrieval.notes.clone();
        if self.config.oneshot.postprocess_enabled {
            let (profile, profile_reasons) =
                self.postprocessor
                    .recommend_profile(&risk_text, &final_sql, Profile::Relaxed);
            postprocess_rules.extend(profile_reasons);
            let outcome = self.postprocessor.postprocess(&risk_text, &final_sql, profile);
            final_sql = outcome.sql;
            postprocess_rules.extend(outcome.rules);
        }

        // Stage 10: intent guard (one rewrite pass + one expert realignment).
        let mut alignment_issues: Vec<String> = Vec::new();
        let mut alignment_repair: Option<String> = None;
        if self.config.oneshot.intent_guard_enabled {
            let outcome = enforce_intent_alignment(
                &self.postprocessor,
                &risk_text,
                &final_sql,
                planner_intent.as_ref(),
            );
            final_sql = outcome.sql;
            postprocess_rules.extend(outcome.applied_rules);
            alignment_issues = outcome.remaining_issues;

            let age_issue_remains = alignment_issues
                .iter()
                .any(|issue| issue == "age_intent_mapped_to_anchor_year_group");
            if !alignment_issues.is_empty()
                && self.config.oneshot.intent_realign_enabled
                && (!expert_ran || age_issue_remains)
            {
                match self
                    .sql_agents
                    .expert_review(
                        &question,
                        &final_sql,
                        &context_text,
                        planner_intent.as_ref(),
                        &alignment_issues,
                    )
                    .await
                {
                    Ok(revised) => {
                        let after = detect_intent_alignment_issues(
                            &risk_text,
                            &revised.final_sql,
                            planner_intent.as_ref(),
                        );
                        let improved = after.len() < alignment_issues.len();
                        let no_regression =
                            after.iter().all(|issue| alignment_issues.contains(issue));
                        if improved && no_regression {
                            alignment_repair = Some("expert_realignment".to_string());
                            final_sql = revised.final_sql;
                            alignment_issues = after;
                        }
                    }
                    Err(err) => {
                        tracing::warn!("Expert realignment failed, keeping SQL: {}", err)
                    }
                }
            }
        }

        // Stage 11: policy gate (advisory here; run enforces again).
        let scope_tables = self.cache.load_table_scope(user);
        let effective_scope = if self.cache.scope_is_effectively_all(&scope_tables) {
            Vec::new()
        } else {
            scope_tables
        };
        let policy_report = self.policy.evaluate(&final_sql, Some(&risk_text), &effective_scope);

        self.query_state.save(&qid, &question, &final_sql, user).await?;
        self.events.emit(
            "oneshot.complete",
            json!({
                "request_id": &request_id,
                "qid": &qid,
                "risk": risk_info.risk,
                "complexity": risk_info.complexity,
                "planner_activated": planner_decision.activated,
                "expert_ran": expert_ran,
                "alignment_issues": &alignment_issues,
                "policy_passed": policy_report.passed,
            }),
        );

        Ok(OrchestratorResult {
            qid,
            question: raw_question,
            question_en,
            planner: planner_intent,
            planner_decision,
            risk: risk_info,
            context,
            draft: draft_sql,
            final_sql: FinalSql {
                final_sql,
                postprocess: postprocess_rules,
                intent_alignment_issues: alignment_issues,
                intent_alignment_repair: alignment_repair,
            },
            policy: Some(policy_report),
            clarification: None,
            mode: "advanced".to_string(),
            assumptions,
            request_id,
        })
    }

    /// Execute a stored (or raw) query under policy, with one bounded repair
    /// pass on failure.
    pub async fn run(&self, request: RunRequest) -> ApiResult<RunResponse> {
        if !request.user_ack {
            return Err(ApiError::validation_error("user_ack is required to execute SQL"));
        }
        let user = request.user_name.as_deref();
        let (question, sql, qid) = match (&request.qid, &request.sql) {
            (Some(qid), _) => {
                let stored = self.query_state.load(qid).await?;
                (stored.question, stored.sql, qid.clone())
            }
            (None, Some(sql)) if !sql.trim().is_empty() => {
                (String::new(), sql.trim().to_string(), uuid::Uuid::new_v4().simple().to_string())
            }
            _ => return Err(ApiError::invalid_data("either qid or sql is required")),
        };

        let scope_tables = self.cache.load_table_scope(user);
        let effective_scope = if self.cache.scope_is_effectively_all(&scope_tables) {
            Vec::new()
        } else {
            scope_tables
        };
        let question_opt = (!question.is_empty()).then_some(question.as_str());

        // Policy gate: deferred violations still enter the repair loop.
        let mut current_sql = sql.clone();
        let mut repair_rules: Vec<String> = Vec::new();
        let mut policy_report =
            self.policy.evaluate(&current_sql, question_opt, &effective_scope);
        if !policy_report.passed {
            let violation = violation_error(&policy_report, &current_sql);
            if policy_report.deferred && self.config.repair.auto_repair_enabled {
                let (repaired, rules) =
                    self.attempt_policy_repair(&question, &current_sql, &violation.to_string());
                if let Some(repaired) = repaired {
                    repair_rules.extend(rules);
                    current_sql = repaired;
                    policy_report =
                        self.policy.evaluate(&current_sql, question_opt, &effective_scope);
                }
            }
            if !policy_report.passed {
                self.events.emit_level(
                    "warn",
                    "run.policy_blocked",
                    json!({"qid": &qid, "error": violation.to_string()}),
                );
                return Err(violation_error(&policy_report, &current_sql));
            }
        }

        let budget_ms = self.config.server.api_request_timeout_sec * 1000;
        let (timeout_ms, near_limit) =
            effective_timeout_ms(self.config.effective_db_timeout_sec() * 1000, budget_ms);
        if near_limit {
            self.events.emit_level(
                "warn",
                "run.timeout_near_limit",
                json!({"qid": &qid, "timeout_ms": timeout_ms, "budget_ms": budget_ms}),
            );
        }
        let opts = ExecOptions { timeout_ms, tag: qid.clone(), accuracy_mode: false };

        let started = Instant::now();
        let mut repaired = false;
        let first_attempt = self.pool.execute(user, &current_sql, &opts).await;
        let result = match first_attempt {
            Ok(result) => Ok(result),
            Err(exec_err) if self.config.repair.auto_repair_enabled => {
                self.events.emit_level(
                    "warn",
                    "run.exec_error",
                    json!({"qid": &qid, "class": exec_err.class.as_str(), "error": &exec_err.message}),
                );
                let mut outcome = Err(exec_err.clone());
                for _attempt in 0..self.config.repair.max_attempts.max(1) {
                    match self
                        .repair_once(
                            &question,
                            &current_sql,
                            &exec_err.message,
                            user,
                            &opts,
                            question_opt,
                            &effective_scope,
                        )
                        .await
                    {
                        Some((fixed_sql, rules, exec_result)) => {
                            repaired = true;
                            repair_rules.extend(rules.clone());
                            self.learned.upsert(
                                &current_sql,
                                &fixed_sql,
                                &exec_err.message,
                                &rules,
                            );
                            current_sql = fixed_sql;
                            outcome = Ok(exec_result);
                            break;
                        }
                        None => continue,
                    }
                }
                outcome
            }
            Err(exec_err) => Err(exec_err),
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(exec_result) => {
                let _ = self
                    .audit
                    .record(
                        &qid,
                        user,
                        question_opt,
                        &current_sql,
                        "success",
                        None,
                        exec_result.elapsed_ms,
                    )
                    .await;
                self.events.emit(
                    "run.success",
                    json!({
                        "qid": &qid,
                        "rows": exec_result.row_count,
                        "elapsed_ms": exec_result.elapsed_ms,
                        "repaired": repaired,
                    }),
                );
                Ok(RunResponse {
                    columns: exec_result.columns,
                    rows: exec_result.rows,
                    row_count: exec_result.row_count,
                    row_cap: exec_result.row_cap,
                    elapsed_ms: exec_result.elapsed_ms,
                    query_hash: exec_result.query_hash,
                    final_sql: current_sql,
                    policy: policy_report,
                    repair_rules,
                    repaired,
                })
            }
            Err(exec_err) => {
                let _ = self
                    .audit
                    .record(
                        &qid,
                        user,
                        question_opt,
                        &current_sql,
                        "error",
                        Some(&exec_err.message),
                        elapsed_ms,
                    )
                    .await;
                self.events.emit_level(
                    "error",
                    "run.failed",
                    json!({"qid": &qid, "class": exec_err.class.as_str(), "error": &exec_err.message}),
                );
                Err(ApiError::ExecutionFailed {
                    error_class: exec_err.class.as_str().to_string(),
                    message: exec_err.message,
                    query_hash: crate::utils::sql_text::sql_hash(&current_sql),
                    elapsed_ms: exec_err.elapsed_ms,
                    timeout_ms,
                })
            }
        }
    }

    /// Deterministic-only repair for deferred policy violations (no executor
    /// involved yet).
    fn attempt_policy_repair(
        &self,
        question: &str,
        sql: &str,
        error_message: &str,
    ) -> (Option<String>, Vec<String>) {
        if let Some(fix) = self.learned.find(sql, error_message) {
            self.learned.mark_used(&fix.id);
            return (Some(fix.fixed_sql), vec!["learned_fix".to_string()]);
        }
        let (rewritten, rules) = apply_sql_error_templates(question, sql, error_message);
        if rewritten.trim() != sql.trim() {
            return (Some(rewritten), rules);
        }
        (None, Vec::new())
    }

    /// One ordered recovery pass: learned fix, then templates, then the LLM
    /// repair agent. Each stage only runs when the previous one produced no
    /// executable candidate.
    #[allow(clippy::too_many_arguments)]
    async fn repair_once(
        &self,
        question: &str,
        failed_sql: &str,
        error_message: &str,
        user: Option<&str>,
        opts: &ExecOptions,
        policy_question: Option<&str>,
        effective_scope: &[String],
    ) -> Option<(String, Vec<String>, crate::services::oracle::ExecResult)> {
        // 1) Learned-fix store.
        if let Some(fix) = self.learned.find(failed_sql, error_message) {
            self.learned.mark_used(&fix.id);
            if let Some(hit) = self
                .try_candidate(fix.fixed_sql, vec!["learned_fix".to_string()], user, opts, policy_question, effective_scope)
                .await
            {
                return Some(hit);
            }
        }

        // 2) Deterministic error templates.
        let (templated, template_rules) =
            apply_sql_error_templates(question, failed_sql, error_message);
        if templated.trim() != failed_sql.trim() {
            if let Some(hit) = self
                .try_candidate(templated, template_rules, user, opts, policy_question, effective_scope)
                .await
            {
                return Some(hit);
            }
        }

        // 3) LLM repair pass; a minimal aggressive post-process keeps its
        // output aligned with the schema dictionaries.
        let parsed = parse_sql_error(error_message, failed_sql);
        if let Ok(repair_draft) = self
            .sql_agents
            .repair(question, "", failed_sql, &parsed, None)
            .await
        {
            if crate::utils::sql_text::normalize_sql(&repair_draft.final_sql)
                != crate::utils::sql_text::normalize_sql(failed_sql)
            {
                let outcome = self.postprocessor.postprocess(
                    question,
                    &repair_draft.final_sql,
                    Profile::Aggressive,
                );
                let mut rules = vec!["llm_repair".to_string()];
                rules.extend(outcome.rules);
                if let Some(hit) = self
                    .try_candidate(outcome.sql, rules, user, opts, policy_question, effective_scope)
                    .await
                {
                    return Some(hit);
                }
            }
        }
        None
    }

    #[allow(clippy::too_many_arguments)]
    async fn try_candidate(
        &self,
        candidate_sql: String,
        rules: Vec<String>,
        user: Option<&str>,
        opts: &ExecOptions,
        policy_question: Option<&str>,
        effective_scope: &[String],
    ) -> Option<(String, Vec<String>, crate::services::oracle::ExecResult)> {
        let report = self.policy.evaluate(&candidate_sql, policy_question, effective_scope);
        if !report.passed {
            tracing::warn!("Repair candidate blocked by policy");
            return None;
        }
        match self.pool.execute(user, &candidate_sql, opts).await {
            Ok(result) => Some((candidate_sql, rules, result)),
            Err(err) => {
                tracing::warn!("Repair candidate failed: {}", err);
                None
            }
        }
    }
}
