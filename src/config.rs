use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub llm: LlmConfig,
    pub oracle: OracleConfig,
    pub planner: PlannerConfig,
    pub expert: ExpertConfig,
    pub rag: RagConfig,
    pub repair: RepairConfig,
    pub oneshot: OneshotConfig,
    pub policy: PolicyConfig,
    pub visualize: VisualizeConfig,
    pub metadata: MetadataConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Outer request timeout; must exceed the Oracle call timeout.
    pub api_request_timeout_sec: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Local sqlite state database (audit log, oneshot query state).
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub api_base: String,
    pub api_key: String,
    pub timeout_sec: u64,
    pub engineer_model: String,
    pub expert_model: String,
    pub planner_model: String,
    pub clarifier_model: String,
    pub max_output_tokens: u32,
    pub max_output_tokens_clarifier: u32,
    /// Token budget for the retrieved context handed to the SQL agents.
    pub context_token_budget: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    /// SQL gateway endpoint; the Oracle driver itself lives behind it.
    pub gateway_url: String,
    pub default_schema: String,
    /// DB_TIMEOUT_SEC; the call timeout floors at 180s.
    pub timeout_sec: u64,
    /// ROW_CAP applied by the executor.
    pub row_cap: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// PLANNER_ACTIVATION_MODE: off | always | complex_only
    pub activation_mode: String,
    pub complexity_threshold: i32,
    pub min_question_tokens: usize,
    pub required_gate_count: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExpertConfig {
    /// EXPERT_TRIGGER_MODE: off | always | score
    pub trigger_mode: String,
    pub score_threshold: i32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RagConfig {
    /// RAG_RETRIEVAL_MODE: bm25_then_rerank | hybrid_legacy
    pub retrieval_mode: String,
    pub top_k: usize,
    pub hybrid_enabled: bool,
    pub bm25_max_docs: usize,
    pub dense_candidates: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    pub auto_repair_enabled: bool,
    pub max_attempts: u32,
    /// Learned-fix store LRU bound.
    pub max_rules: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OneshotConfig {
    pub postprocess_enabled: bool,
    pub intent_guard_enabled: bool,
    pub intent_realign_enabled: bool,
    pub default_scope_autofill_enabled: bool,
    pub translate_ko_to_en: bool,
    pub max_retry_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub max_joins: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VisualizeConfig {
    /// VIS_MAX_ROWS cap on inbound rows.
    pub max_rows: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    /// Directory holding JSONL corpora, schema catalog, join graph,
    /// learned fixes, and table-scope settings.
    pub dir: String,
    /// Append-only NDJSON events log.
    pub events_log: String,
}

/// Command line arguments for configuration overrides
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "clinsight")]
#[command(version, about = "Clinsight - clinical text-to-SQL analytics backend")]
pub struct CommandLineArgs {
    /// Path to configuration file
    #[arg(long, value_name = "PATH")]
    pub config: Option<String>,

    /// Server host (overrides config file)
    #[arg(long, value_name = "HOST")]
    pub server_host: Option<String>,

    /// Server port (overrides config file)
    #[arg(long, value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Local state database URL (overrides config file)
    #[arg(long, value_name = "URL")]
    pub database_url: Option<String>,

    /// Logging level (overrides config file, e.g., "info,clinsight=debug")
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Metadata directory (overrides config file)
    #[arg(long, value_name = "PATH")]
    pub metadata_dir: Option<String>,
}

impl Config {
    /// Load configuration with command line, environment variable, and file support
    ///
    /// Loading order (priority from highest to lowest):
    /// 1. Command line arguments
    /// 2. Environment variables (.env loaded first via dotenvy)
    /// 3. Configuration file (config.toml)
    /// 4. Default values
    pub fn load() -> Result<Self, anyhow::Error> {
        // Tunables may live in a local .env; a missing file is fine.
        let _ = dotenvy::dotenv();

        let cli_args = CommandLineArgs::parse();
        Self::load_with_args(cli_args)
    }

    pub fn load_with_args(cli_args: CommandLineArgs) -> Result<Self, anyhow::Error> {
        let config_path = cli_args.config.clone().or_else(Self::find_config_file);
        let mut config = if let Some(config_path) = config_path {
            Self::from_toml(&config_path)?
        } else {
            tracing::warn!("Configuration file not found, using defaults");
            Config::default()
        };

        config.apply_env_overrides();
        config.apply_cli_overrides(&cli_args);
        config.validate()?;

        Ok(config)
    }

    /// Apply environment variable overrides.
    ///
    /// Server/logging knobs use the APP_ prefix; pipeline tunables keep their
    /// historical un-prefixed names (RAG_TOP_K, EXPERT_TRIGGER_MODE, ...).
    fn apply_env_overrides(&mut self) {
        fn env_string(name: &str, slot: &mut String) {
            if let Ok(value) = std::env::var(name) {
                if !value.trim().is_empty() {
                    *slot = value;
                    tracing::info!("Override {} from env", name);
                }
            }
        }
        fn env_parse<T: std::str::FromStr>(name: &str, slot: &mut T) {
            if let Ok(value) = std::env::var(name) {
                if let Ok(parsed) = value.trim().parse::<T>() {
                    *slot = parsed;
                    tracing::info!("Override {} from env", name);
                } else {
                    tracing::warn!("Invalid {} value '{}' (keeping default)", name, value);
                }
            }
        }
        fn env_bool(name: &str, slot: &mut bool) {
            if let Ok(value) = std::env::var(name) {
                match value.trim().to_lowercase().as_str() {
                    "1" | "true" | "yes" | "on" => *slot = true,
                    "0" | "false" | "no" | "off" => *slot = false,
                    other => {
                        tracing::warn!("Invalid {} value '{}' (keeping default)", name, other);
                        return;
                    }
                }
                tracing::info!("Override {} from env", name);
            }
        }

        env_string("APP_SERVER_HOST", &mut self.server.host);
        env_parse("APP_SERVER_PORT", &mut self.server.port);
        env_parse("API_REQUEST_TIMEOUT_SEC", &mut self.server.api_request_timeout_sec);
        env_string("APP_DATABASE_URL", &mut self.database.url);
        env_string("APP_LOG_LEVEL", &mut self.logging.level);
        env_string("METADATA_DIR", &mut self.metadata.dir);
        env_string("EVENTS_LOG_PATH", &mut self.metadata.events_log);

        env_string("LLM_API_BASE", &mut self.llm.api_base);
        env_string("LLM_API_KEY", &mut self.llm.api_key);
        env_parse("LLM_TIMEOUT_SEC", &mut self.llm.timeout_sec);
        env_string("LLM_ENGINEER_MODEL", &mut self.llm.engineer_model);
        env_string("LLM_EXPERT_MODEL", &mut self.llm.expert_model);
        env_string("LLM_PLANNER_MODEL", &mut self.llm.planner_model);
        env_string("LLM_CLARIFIER_MODEL", &mut self.llm.clarifier_model);
        env_parse("LLM_MAX_OUTPUT_TOKENS", &mut self.llm.max_output_tokens);
        env_parse("LLM_MAX_OUTPUT_TOKENS_CLARIFIER", &mut self.llm.max_output_tokens_clarifier);
        env_parse("CONTEXT_TOKEN_BUDGET", &mut self.llm.context_token_budget);

        env_string("ORACLE_GATEWAY_URL", &mut self.oracle.gateway_url);
        env_string("ORACLE_DEFAULT_SCHEMA", &mut self.oracle.default_schema);
        env_parse("DB_TIMEOUT_SEC", &mut self.oracle.timeout_sec);
        env_parse("ROW_CAP", &mut self.oracle.row_cap);

        env_string("PLANNER_ACTIVATION_MODE", &mut self.planner.activation_mode);
        env_parse("PLANNER_COMPLEXITY_THRESHOLD", &mut self.planner.complexity_threshold);
        env_parse("PLANNER_MIN_QUESTION_TOKENS", &mut self.planner.min_question_tokens);
        env_parse("PLANNER_REQUIRED_GATE_COUNT", &mut self.planner.required_gate_count);

        env_string("EXPERT_TRIGGER_MODE", &mut self.expert.trigger_mode);
        env_parse("EXPERT_SCORE_THRESHOLD", &mut self.expert.score_threshold);

        env_string("RAG_RETRIEVAL_MODE", &mut self.rag.retrieval_mode);
        env_parse("RAG_TOP_K", &mut self.rag.top_k);
        env_bool("RAG_HYBRID_ENABLED", &mut self.rag.hybrid_enabled);
        env_parse("RAG_BM25_MAX_DOCS", &mut self.rag.bm25_max_docs);
        env_parse("RAG_DENSE_CANDIDATES", &mut self.rag.dense_candidates);

        env_bool("SQL_AUTO_REPAIR_ENABLED", &mut self.repair.auto_repair_enabled);
        env_parse("SQL_AUTO_REPAIR_MAX_ATTEMPTS", &mut self.repair.max_attempts);
        env_parse("SQL_REPAIR_MAX_RULES", &mut self.repair.max_rules);

        env_bool("ONESHOT_POSTPROCESS_ENABLED", &mut self.oneshot.postprocess_enabled);
        env_bool("ONESHOT_INTENT_GUARD_ENABLED", &mut self.oneshot.intent_guard_enabled);
        env_bool("ONESHOT_INTENT_REALIGN_ENABLED", &mut self.oneshot.intent_realign_enabled);
        env_bool(
            "DEFAULT_SCOPE_AUTOFILL_ENABLED",
            &mut self.oneshot.default_scope_autofill_enabled,
        );
        env_bool("TRANSLATE_KO_TO_EN", &mut self.oneshot.translate_ko_to_en);
        env_parse("MAX_RETRY_ATTEMPTS", &mut self.oneshot.max_retry_attempts);

        env_parse("MAX_DB_JOINS", &mut self.policy.max_joins);
        env_parse("VIS_MAX_ROWS", &mut self.visualize.max_rows);
    }

    /// Apply command line argument overrides (highest priority)
    fn apply_cli_overrides(&mut self, args: &CommandLineArgs) {
        if let Some(host) = &args.server_host {
            self.server.host = host.clone();
            tracing::info!("Override server.host from CLI: {}", self.server.host);
        }
        if let Some(port) = args.server_port {
            self.server.port = port;
            tracing::info!("Override server.port from CLI: {}", self.server.port);
        }
        if let Some(db_url) = &args.database_url {
            self.database.url = db_url.clone();
            tracing::info!("Override database.url from CLI");
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
            tracing::info!("Override logging.level from CLI: {}", self.logging.level);
        }
        if let Some(dir) = &args.metadata_dir {
            self.metadata.dir = dir.clone();
            tracing::info!("Override metadata.dir from CLI: {}", self.metadata.dir);
        }
    }

    /// Validate configuration
    fn validate(&self) -> Result<(), anyhow::Error> {
        if self.server.port == 0 {
            anyhow::bail!("Server port cannot be 0");
        }
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }
        if self.server.api_request_timeout_sec < 190 {
            anyhow::bail!("server.api_request_timeout_sec must be >= 190");
        }
        if self.server.api_request_timeout_sec <= self.effective_db_timeout_sec() {
            anyhow::bail!("server.api_request_timeout_sec must exceed the Oracle call timeout");
        }
        if !matches!(self.planner.activation_mode.as_str(), "off" | "always" | "complex_only") {
            anyhow::bail!("planner.activation_mode must be off|always|complex_only");
        }
        if !matches!(self.expert.trigger_mode.as_str(), "off" | "always" | "score") {
            anyhow::bail!("expert.trigger_mode must be off|always|score");
        }
        if !matches!(self.rag.retrieval_mode.as_str(), "bm25_then_rerank" | "hybrid_legacy") {
            anyhow::bail!("rag.retrieval_mode must be bm25_then_rerank|hybrid_legacy");
        }
        if self.policy.max_joins == 0 {
            anyhow::bail!("policy.max_joins must be > 0");
        }
        Ok(())
    }

    /// Oracle call timeout with the 180s floor applied.
    pub fn effective_db_timeout_sec(&self) -> u64 {
        self.oracle.timeout_sec.max(180)
    }

    fn find_config_file() -> Option<String> {
        let possible_paths =
            ["conf/config.toml", "config.toml", "./conf/config.toml", "./config.toml"];

        for path in &possible_paths {
            if Path::new(path).exists() {
                return Some(path.to_string());
            }
        }
        None
    }

    fn from_toml(path: &str) -> Result<Self, anyhow::Error> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "0.0.0.0".to_string(), port: 8080, api_request_timeout_sec: 200 }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { url: "sqlite://data/clinsight.db?mode=rwc".to_string() }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info,clinsight=debug".to_string(),
            file: Some("logs/clinsight.log".to_string()),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:11434/v1".to_string(),
            api_key: String::new(),
            timeout_sec: 120,
            engineer_model: "gpt-4o".to_string(),
            expert_model: "gpt-4o".to_string(),
            planner_model: "gpt-4o-mini".to_string(),
            clarifier_model: "gpt-4o-mini".to_string(),
            max_output_tokens: 1200,
            max_output_tokens_clarifier: 400,
            context_token_budget: 6000,
        }
    }
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            gateway_url: "http://localhost:9040/sql".to_string(),
            default_schema: "MIMICIV".to_string(),
            timeout_sec: 180,
            row_cap: 1000,
        }
    }
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            activation_mode: "complex_only".to_string(),
            complexity_threshold: 3,
            min_question_tokens: 8,
            required_gate_count: 2,
        }
    }
}

impl Default for ExpertConfig {
    fn default() -> Self {
        Self { trigger_mode: "score".to_string(), score_threshold: 4 }
    }
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            retrieval_mode: "bm25_then_rerank".to_string(),
            top_k: 6,
            hybrid_enabled: true,
            bm25_max_docs: 2500,
            dense_candidates: 50,
        }
    }
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self { auto_repair_enabled: true, max_attempts: 1, max_rules: 200 }
    }
}

impl Default for OneshotConfig {
    fn default() -> Self {
        Self {
            postprocess_enabled: true,
            intent_guard_enabled: true,
            intent_realign_enabled: true,
            default_scope_autofill_enabled: false,
            translate_ko_to_en: true,
            max_retry_attempts: 2,
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self { max_joins: 6 }
    }
}

impl Default for VisualizeConfig {
    fn default() -> Self {
        Self { max_rows: 10000 }
    }
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            dir: "var/metadata".to_string(),
            events_log: "var/events/events.ndjson".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn db_timeout_floors_at_180s() {
        let mut config = Config::default();
        config.oracle.timeout_sec = 30;
        assert_eq!(config.effective_db_timeout_sec(), 180);
    }
}
