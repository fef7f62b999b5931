//! HTTP executor for the external Oracle SQL gateway.
//!
//! The gateway wraps the actual Oracle driver/pool. This client adds the
//! schema-mismatch recovery the pipeline relies on: on ORA-00942 it retries
//! once with the metadata-inferred owner, then strips foreign schema
//! prefixes from FROM/JOIN and retries a final time.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::executor::{ExecError, ExecOptions, ExecResult, SqlExecutor};
use crate::config::OracleConfig;
use crate::services::metadata::MetadataCache;
use crate::utils::sql_text::{extract_table_refs, sql_hash, table_ref_candidates};

static SCHEMA_PREFIX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(FROM|JOIN)\s+([A-Za-z_][A-Za-z0-9_$#]*)\.([A-Za-z_][A-Za-z0-9_$#]*)")
        .expect("valid regex")
});

#[derive(Debug, Serialize)]
struct GatewayRequest<'a> {
    sql: &'a str,
    timeout_ms: u64,
    schema: &'a str,
    tag: &'a str,
    accuracy_mode: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    row_cap: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct GatewayResponse {
    #[serde(default)]
    columns: Vec<String>,
    #[serde(default)]
    rows: Vec<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    row_count: Option<usize>,
    #[serde(default)]
    row_cap: Option<usize>,
    #[serde(default)]
    total_count: Option<usize>,
    #[serde(default)]
    elapsed_ms: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

pub struct OracleGatewayExecutor {
    http_client: Client,
    gateway_url: String,
    default_schema: String,
    row_cap: usize,
    cache: Arc<MetadataCache>,
}

impl OracleGatewayExecutor {
    pub fn new(config: &OracleConfig, cache: Arc<MetadataCache>) -> Self {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_sec.max(180) + 10))
            .build()
            .unwrap_or_else(|e| {
                tracing::error!("Failed to build Oracle gateway client: {}. Using defaults.", e);
                Client::default()
            });
        Self {
            http_client,
            gateway_url: config.gateway_url.clone(),
            default_schema: config.default_schema.clone(),
            row_cap: config.row_cap,
            cache,
        }
    }

    async fn execute_once(
        &self,
        sql: &str,
        schema: &str,
        opts: &ExecOptions,
    ) -> Result<ExecResult, ExecError> {
        let started = Instant::now();
        let request = GatewayRequest {
            sql,
            timeout_ms: opts.timeout_ms,
            schema,
            tag: &opts.tag,
            accuracy_mode: opts.accuracy_mode,
            row_cap: (!opts.accuracy_mode).then_some(self.row_cap),
        };

        let response = self
            .http_client
            .post(&self.gateway_url)
            .json(&request)
            .timeout(Duration::from_millis(opts.timeout_ms + 5_000))
            .send()
            .await
            .map_err(|e| {
                let elapsed = started.elapsed().as_millis() as u64;
                if e.is_timeout() {
                    ExecError::new(
                        format!("DPY-4024: call timeout of {} ms exceeded", opts.timeout_ms),
                        elapsed,
                    )
                } else {
                    ExecError::new(format!("gateway unreachable: {}", e), elapsed)
                }
            })?;

        let elapsed = started.elapsed().as_millis() as u64;
        let status = response.status();
        let payload: GatewayResponse = response.json().await.map_err(|e| {
            ExecError::new(format!("gateway returned malformed payload: {}", e), elapsed)
        })?;

        if let Some(error) = payload.error {
            return Err(ExecError::new(error, elapsed));
        }
        if !status.is_success() {
            return Err(ExecError::new(format!("gateway error status {}", status), elapsed));
        }

        let row_count = payload.row_count.unwrap_or(payload.rows.len());
        Ok(ExecResult {
            columns: payload.columns,
            rows: payload.rows,
            row_count,
            row_cap: payload.row_cap,
            total_count: payload.total_count,
            elapsed_ms: payload.elapsed_ms.unwrap_or(elapsed),
            query_hash: sql_hash(sql),
        })
    }

    /// Owner recorded in the schema catalog for the first resolvable table.
    fn inferred_owner(&self, sql: &str) -> Option<String> {
        for raw in extract_table_refs(sql) {
            for candidate in table_ref_candidates(&raw) {
                if let Some(owner) = self.cache.table_owner(&candidate) {
                    if !owner.eq_ignore_ascii_case(&self.default_schema) {
                        return Some(owner);
                    }
                }
            }
        }
        None
    }

    fn strip_foreign_schema_prefixes(&self, sql: &str, keep: &str) -> String {
        SCHEMA_PREFIX_RE
            .replace_all(sql, |caps: &regex::Captures<'_>| {
                let prefix = &caps[2];
                if prefix.eq_ignore_ascii_case(keep) {
                    caps[0].to_string()
                } else {
                    format!("{} {}", &caps[1], &caps[3])
                }
            })
            .into_owned()
    }
}

#[async_trait]
impl SqlExecutor for OracleGatewayExecutor {
    async fn execute(&self, sql: &str, opts: &ExecOptions) -> Result<ExecResult, ExecError> {
        let first = self.execute_once(sql, &self.default_schema, opts).await;
        let err = match first {
            Ok(result) => return Ok(result),
            Err(err) => err,
        };
        if !err.message.to_uppercase().contains("ORA-00942") {
            return Err(err);
        }

        if let Some(owner) = self.inferred_owner(sql) {
            tracing::info!("ORA-00942: retrying with inferred owner {}", owner);
            match self.execute_once(sql, &owner, opts).await {
                Ok(result) => return Ok(result),
                Err(retry_err) => {
                    if !retry_err.message.to_uppercase().contains("ORA-00942") {
                        return Err(retry_err);
                    }
                }
            }
        }

        let stripped = self.strip_foreign_schema_prefixes(sql, &self.default_schema);
        if stripped != sql {
            tracing::info!("ORA-00942: retrying with foreign schema prefixes stripped");
            return self.execute_once(&stripped, &self.default_schema, opts).await;
        }
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn foreign_prefixes_are_stripped_but_target_kept() {
        let dir = tempfile::tempdir().unwrap();
        let executor = OracleGatewayExecutor::new(
            &OracleConfig::default(),
            Arc::new(MetadataCache::new(dir.path())),
        );
        let sql = "SELECT * FROM OTHER.ADMISSIONS A JOIN MIMICIV.PATIENTS P ON A.SUBJECT_ID = P.SUBJECT_ID";
        let stripped = executor.strip_foreign_schema_prefixes(sql, "MIMICIV");
        assert!(stripped.contains("FROM ADMISSIONS"));
        assert!(stripped.contains("MIMICIV.PATIENTS"));
    }
}
