use axum::{
    Router,
    middleware as axum_middleware,
    routing::{delete, get, post},
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use clinsight::config::Config;
use clinsight::db;
use clinsight::models;
use clinsight::services::llm::OpenAiCompatClient;
use clinsight::services::{
    AuditService, ChartRuleEngine, EventLog, ExecutorPool, HybridRetriever, LearnedFixStore,
    LocalDocStore, MetadataCache, NoopEmbedder, Orchestrator, OracleGatewayExecutor,
    PostProcessor, QueryStateStore,
};
use clinsight::services::agents::{Clarifier, Planner, SqlAgents, Translator};
use clinsight::services::audit::AuditLogEntry;
use clinsight::services::oracle::SqlExecutor;
use clinsight::{AppState, handlers, middleware};

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::query::oneshot,
        handlers::query::run,
        handlers::visualize::visualize,
        handlers::admin::oracle_pool_status,
        handlers::admin::get_table_scope,
        handlers::admin::set_table_scope,
        handlers::admin::metadata_sync,
        handlers::admin::rag_reindex,
        handlers::audit::list_logs,
        handlers::audit::delete_log,
    ),
    components(
        schemas(
            models::OneshotRequest,
            models::RunRequest,
            models::RunResponse,
            models::OrchestratorResult,
            models::PlannerIntent,
            models::PlannerDecision,
            models::ClarifierResult,
            models::RiskInfo,
            models::PolicyCheck,
            models::PolicyReport,
            models::ChartSpec,
            models::ChartPlan,
            models::DataFrame,
            handlers::visualize::VisualizeRequest,
            handlers::admin::PoolStatusResponse,
            handlers::admin::TableScopeResponse,
            handlers::admin::UpdateTableScopeRequest,
            handlers::admin::MetadataSyncResponse,
            AuditLogEntry,
        )
    ),
    tags(
        (name = "Query", description = "Text-to-SQL generation and execution"),
        (name = "Visualize", description = "Chart recommendation"),
        (name = "Admin", description = "Metadata, scope, and pool administration"),
        (name = "Audit", description = "Executed-query audit log"),
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let log_filter = tracing_subscriber::EnvFilter::new(&config.logging.level);
    let registry = tracing_subscriber::registry().with(log_filter);

    // Keep the non-blocking writer guard alive for the process lifetime.
    let mut _log_guard = None;
    if let Some(log_file) = &config.logging.file {
        let log_path = std::path::Path::new(log_file);
        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let log_dir = log_path.parent().and_then(|p| p.to_str()).unwrap_or("logs");
        let file_name = log_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("clinsight.log");
        let file_prefix = file_name.strip_suffix(".log").unwrap_or(file_name);

        let file_appender = tracing_appender::rolling::daily(log_dir, file_prefix);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        _log_guard = Some(guard);
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .with(tracing_subscriber::fmt::layer())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
    tracing::info!("Clinsight starting up");
    tracing::info!("Configuration loaded successfully");

    let pool = db::create_pool(&config.database.url).await?;
    tracing::info!("State database pool created successfully");

    let config = Arc::new(config);
    let metadata_cache = Arc::new(MetadataCache::new(&config.metadata.dir));
    let events = Arc::new(EventLog::new(&config.metadata.events_log));
    let learned = Arc::new(LearnedFixStore::new(
        std::path::Path::new(&config.metadata.dir).join("sql_error_repair_rules.json"),
        config.repair.max_rules,
    ));

    let llm = Arc::new(OpenAiCompatClient::new(&config.llm));
    let doc_store = Arc::new(LocalDocStore::new(Arc::clone(&metadata_cache)));
    let retriever = Arc::new(HybridRetriever::new(
        Arc::clone(&metadata_cache),
        doc_store,
        Arc::new(NoopEmbedder),
        config.rag.clone(),
    ));
    let postprocessor = Arc::new(PostProcessor::new(Arc::clone(&metadata_cache)));

    let gateway_config = config.oracle.clone();
    let gateway_cache = Arc::clone(&metadata_cache);
    let executor_pool = Arc::new(ExecutorPool::new(Box::new(move |_key| {
        Arc::new(OracleGatewayExecutor::new(&gateway_config, Arc::clone(&gateway_cache)))
            as Arc<dyn SqlExecutor>
    })));

    let audit_service = Arc::new(AuditService::new(pool.clone()));
    let query_state = Arc::new(QueryStateStore::new(pool.clone()));

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&config),
        Clarifier::new(llm.clone(), &config.llm),
        Translator::new(llm.clone(), &config.llm),
        Planner::new(llm.clone(), &config.llm),
        SqlAgents::new(llm.clone(), &config.llm),
        Arc::clone(&retriever),
        Arc::clone(&postprocessor),
        Arc::clone(&executor_pool),
        Arc::clone(&learned),
        Arc::clone(&metadata_cache),
        Arc::clone(&events),
        Arc::clone(&query_state),
        Arc::clone(&audit_service),
    ));
    tracing::info!("Orchestrator initialized");

    let chart_engine = Arc::new(ChartRuleEngine::new(
        Some(llm.clone()),
        config.llm.clarifier_model.clone(),
        config.llm.max_output_tokens,
    ));
    tracing::info!("Chart rule engine initialized");

    let app_state = Arc::new(AppState {
        config: Arc::clone(&config),
        db: pool.clone(),
        metadata_cache: Arc::clone(&metadata_cache),
        executor_pool: Arc::clone(&executor_pool),
        events: Arc::clone(&events),
        orchestrator,
        chart_engine,
        audit_service,
        query_state,
    });

    let timeout_state = middleware::RequestTimeout {
        duration: Duration::from_secs(config.server.api_request_timeout_sec),
    };

    let api_routes = Router::new()
        .route("/query/oneshot", post(handlers::query::oneshot))
        .route("/query/run", post(handlers::query::run))
        .route("/visualize", post(handlers::visualize::visualize))
        .route("/admin/oracle/pool/status", get(handlers::admin::oracle_pool_status))
        .route(
            "/admin/settings/table-scope",
            get(handlers::admin::get_table_scope).post(handlers::admin::set_table_scope),
        )
        .route("/admin/metadata/sync", post(handlers::admin::metadata_sync))
        .route("/admin/rag/reindex", post(handlers::admin::rag_reindex))
        .route("/audit/logs", get(handlers::audit::list_logs))
        .route("/audit/logs/:id", delete(handlers::audit::delete_log))
        .with_state(Arc::clone(&app_state))
        .layer(axum_middleware::from_fn_with_state(
            timeout_state,
            middleware::request_timeout_middleware,
        ));

    let health_routes = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(ready_check));

    let app = Router::new()
        .merge(SwaggerUi::new("/api-docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_routes)
        .merge(health_routes)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on http://{}", addr);
    tracing::info!("API documentation available at http://{}/api-docs", addr);
    tracing::info!("Clinsight is ready to serve requests");

    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check() -> &'static str {
    "OK"
}

async fn ready_check() -> &'static str {
    "READY"
}
