//! Axum service for Scraper SRE: the JSON API for registration, run ingestion and
//! read-only views, plus server-rendered operator pages.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use ssre_core::{
    Alert, AppConfig, IngestAck, RepairSuggestion, RunSubmission, Scraper, ScraperConfig,
    ScraperRun,
};
use ssre_pipeline::{AnalysisPipeline, TaskExecutor, TokioExecutor};
use ssre_repair::{PromptSynthesizer, RepairSuggester, RepairTrigger, StubRepairSuggester};
use ssre_storage::RunStore;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

mod error;
mod pages;

pub use error::{ApiError, ErrorBody};

pub const CRATE_NAME: &str = "ssre-web";

const DEFAULT_LIST_LIMIT: usize = 20;
const MAX_LIST_LIMIT: usize = 200;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RunStore>,
    pub pipeline: Arc<AnalysisPipeline>,
    pub executor: Arc<dyn TaskExecutor>,
}

impl AppState {
    /// Wire the analysis pipeline over `store` with the given suggester and executor.
    pub fn new(
        store: Arc<dyn RunStore>,
        suggester: Arc<dyn RepairSuggester>,
        executor: Arc<dyn TaskExecutor>,
        synthesizer: PromptSynthesizer,
    ) -> Self {
        let repair = RepairTrigger::new(store.clone(), suggester).with_synthesizer(synthesizer);
        let pipeline = Arc::new(AnalysisPipeline::new(store.clone(), repair));
        Self {
            store,
            pipeline,
            executor,
        }
    }

    /// Production wiring: configured store, stub suggester, spawned analysis.
    pub async fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let store = ssre_storage::open_store(config)
            .await
            .context("opening run store")?;
        Ok(Self::new(
            store,
            Arc::new(StubRepairSuggester),
            Arc::new(TokioExecutor),
            PromptSynthesizer::new(config.prompt_dom_char_limit),
        ))
    }
}

pub fn app(state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(health_handler))
        .route("/register", post(register_handler))
        .route("/ingest", post(ingest_handler))
        .route("/scrapers", get(list_scrapers_handler))
        .route("/scrapers/{id}", get(get_scraper_handler))
        .route("/scrapers/{id}/runs", get(list_runs_handler))
        .route("/scrapers/{id}/alerts", get(list_alerts_handler))
        .route("/alerts/{id}/suggestions", get(list_suggestions_handler));

    Router::new()
        .route("/", get(pages::dashboard_handler))
        .route("/scrapers/{id}", get(pages::scraper_page_handler))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(config: &AppConfig, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "scraper sre api listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving http")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("received shutdown signal, starting graceful shutdown");
}

#[derive(Debug, Deserialize, Default)]
struct ListQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
}

fn normalize_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
}

fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::bad_request(format!("invalid id: {raw}")))
}

fn list_limit(query: Result<Query<ListQuery>, QueryRejection>) -> Result<usize, ApiError> {
    query
        .map(|Query(query)| normalize_limit(query.limit))
        .map_err(|rejection| ApiError::bad_request(rejection.body_text()))
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| ApiError::bad_request(rejection.body_text()))
}

async fn require_scraper(store: &dyn RunStore, scraper_id: Uuid) -> Result<Scraper, ApiError> {
    store
        .get_scraper(scraper_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("scraper {scraper_id} not found")))
}

async fn health_handler() -> Json<HealthBody> {
    Json(HealthBody { status: "ok" })
}

async fn register_handler(
    State(state): State<AppState>,
    payload: Result<Json<ScraperConfig>, JsonRejection>,
) -> Result<Json<Scraper>, ApiError> {
    let config = json_body(payload)?;
    config.validate()?;
    let scraper = Scraper::register(config);
    state.store.create_scraper(&scraper).await?;
    info!(scraper_id = %scraper.id, name = %scraper.config.name, "scraper registered");
    Ok(Json(scraper))
}

async fn ingest_handler(
    State(state): State<AppState>,
    payload: Result<Json<RunSubmission>, JsonRejection>,
) -> Result<Json<IngestAck>, ApiError> {
    let submission = json_body(payload)?;
    submission.validate()?;
    require_scraper(state.store.as_ref(), submission.scraper_id).await?;

    let run = submission.into_run();
    state.store.save_run(&run).await?;
    info!(
        run_id = %run.id,
        scraper_id = %run.scraper_id,
        status = %run.status,
        items = run.items_extracted,
        "run ingested"
    );

    let ack = IngestAck::processing(run.id);
    state
        .pipeline
        .clone()
        .schedule(state.executor.as_ref(), run)
        .await;
    Ok(Json(ack))
}

async fn list_scrapers_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<Scraper>>, ApiError> {
    Ok(Json(state.store.list_scrapers().await?))
}

async fn get_scraper_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Scraper>, ApiError> {
    let scraper_id = parse_id(&id)?;
    Ok(Json(require_scraper(state.store.as_ref(), scraper_id).await?))
}

async fn list_runs_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<Vec<ScraperRun>>, ApiError> {
    let scraper_id = parse_id(&id)?;
    let limit = list_limit(query)?;
    require_scraper(state.store.as_ref(), scraper_id).await?;
    let runs = state
        .store
        .list_runs(scraper_id, limit)
        .await?;
    Ok(Json(runs))
}

async fn list_alerts_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<Vec<Alert>>, ApiError> {
    let scraper_id = parse_id(&id)?;
    let limit = list_limit(query)?;
    require_scraper(state.store.as_ref(), scraper_id).await?;
    let alerts = state
        .store
        .list_alerts(scraper_id, limit)
        .await?;
    Ok(Json(alerts))
}

async fn list_suggestions_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<RepairSuggestion>>, ApiError> {
    let alert_id = parse_id(&id)?;
    Ok(Json(state.store.list_repair_suggestions(alert_id).await?))
}
