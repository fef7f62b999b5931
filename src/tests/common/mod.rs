// Common test utilities and helpers

use async_trait::async_trait;
use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::services::llm::{ChatMessage, ChatResponse, LlmClient, LlmError, TokenUsage};
use crate::services::oracle::{ExecError, ExecOptions, ExecResult, SqlExecutor};

/// Create an in-memory SQLite database for testing
pub async fn create_test_db() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(3))
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create test database");

    sqlx::migrate!()
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

/// Scripted LLM double: pops one canned response per chat call and records
/// every prompt for assertions.
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<String>>,
    pub calls: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    pub fn new(responses: Vec<&str>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into_iter().map(|s| s.to_string()).collect()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        _model: &str,
        _max_tokens: u32,
        _expect_json: bool,
    ) -> Result<ChatResponse, LlmError> {
        let prompt = messages
            .iter()
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");
        self.calls.lock().unwrap().push(prompt);
        let next = self.responses.lock().unwrap().pop_front();
        match next {
            Some(content) => Ok(ChatResponse { content, usage: TokenUsage::default() }),
            None => Err(LlmError::ApiError("script exhausted".to_string())),
        }
    }
}

/// Executor double: pops scripted outcomes in order; repeats the last outcome
/// when the script runs dry.
pub struct ScriptedExecutor {
    outcomes: Mutex<VecDeque<Result<ExecResult, ExecError>>>,
    pub executed: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new(outcomes: Vec<Result<ExecResult, ExecError>>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into_iter().collect()),
            executed: Mutex::new(Vec::new()),
        })
    }

    pub fn executed_sql(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl SqlExecutor for ScriptedExecutor {
    async fn execute(&self, sql: &str, _opts: &ExecOptions) -> Result<ExecResult, ExecError> {
        self.executed.lock().unwrap().push(sql.to_string());
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(ExecResult { row_count: 0, ..Default::default() }))
    }
}

pub fn ok_result(rows: usize) -> Result<ExecResult, ExecError> {
    Ok(ExecResult {
        columns: vec!["CNT".to_string()],
        rows: Vec::new(),
        row_count: rows,
        row_cap: None,
        total_count: None,
        elapsed_ms: 5,
        query_hash: String::new(),
    })
}

pub fn exec_error(message: &str) -> Result<ExecResult, ExecError> {
    Err(ExecError::new(message, 3))
}

/// JSON body for a scripted engineer/expert/repair agent response.
pub fn agent_sql_response(sql: &str) -> String {
    serde_json::json!({"final_sql": sql, "used_tables": []}).to_string()
}
