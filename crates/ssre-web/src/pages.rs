//! Server-rendered operator pages: the scraper list and a per-scraper drift view.

use askama::Template;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use ssre_core::{Alert, RepairSuggestion, Scraper, ScraperRun};
use ssre_storage::RunStore;
use uuid::Uuid;

use crate::AppState;

const PAGE_LIST_LIMIT: usize = 20;

#[derive(Debug, Clone)]
struct ScraperRow {
    id: String,
    name: String,
    target_url: String,
    selector_count: usize,
    created_at: String,
}

#[derive(Debug, Clone)]
struct SelectorRow {
    field: String,
    selector: String,
}

#[derive(Debug, Clone)]
struct RunRow {
    recorded_at: String,
    status: String,
    duration: String,
    items_extracted: u64,
    error_message: String,
}

#[derive(Debug, Clone)]
struct SuggestionRow {
    field_name: String,
    old_selector: String,
    suggested_selector: String,
    confidence: String,
}

#[derive(Debug, Clone)]
struct AlertRow {
    drift_type: String,
    severity: String,
    message: String,
    raised_at: String,
    suggestions: Vec<SuggestionRow>,
}

#[derive(Template)]
#[template(path = "index.html")]
struct DashboardTemplate {
    scrapers: Vec<ScraperRow>,
}

#[derive(Template)]
#[template(path = "scraper.html")]
struct ScraperPageTemplate {
    scraper: ScraperRow,
    selectors: Vec<SelectorRow>,
    runs: Vec<RunRow>,
    alerts: Vec<AlertRow>,
}

#[derive(Template)]
#[template(path = "not_found.html")]
struct NotFoundTemplate {
    message: String,
}

fn format_time(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

impl From<&Scraper> for ScraperRow {
    fn from(scraper: &Scraper) -> Self {
        Self {
            id: scraper.id.to_string(),
            name: scraper.config.name.clone(),
            target_url: scraper.config.target_url.clone(),
            selector_count: scraper.config.selectors.len(),
            created_at: format_time(scraper.created_at),
        }
    }
}

impl From<&ScraperRun> for RunRow {
    fn from(run: &ScraperRun) -> Self {
        Self {
            recorded_at: format_time(run.timestamp),
            status: run.status.to_string(),
            duration: format!("{:.1} ms", run.duration_ms),
            items_extracted: run.items_extracted,
            error_message: run.error_message.clone().unwrap_or_default(),
        }
    }
}

impl From<&RepairSuggestion> for SuggestionRow {
    fn from(suggestion: &RepairSuggestion) -> Self {
        Self {
            field_name: suggestion.field_name.clone(),
            old_selector: suggestion.old_selector.clone(),
            suggested_selector: suggestion.suggested_selector.clone(),
            confidence: format!("{:.2}", suggestion.confidence_score),
        }
    }
}

impl AlertRow {
    fn new(alert: &Alert, suggestions: &[RepairSuggestion]) -> Self {
        Self {
            drift_type: alert.drift_type.to_string(),
            severity: alert.severity.to_string(),
            message: alert.message.clone(),
            raised_at: format_time(alert.timestamp),
            suggestions: suggestions.iter().map(SuggestionRow::from).collect(),
        }
    }
}

pub(crate) async fn dashboard_handler(State(state): State<AppState>) -> Response {
    match state.store.list_scrapers().await {
        Ok(scrapers) => render_html(DashboardTemplate {
            scrapers: scrapers.iter().map(ScraperRow::from).collect(),
        }),
        Err(err) => server_error(err.into()),
    }
}

pub(crate) async fn scraper_page_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let Ok(scraper_id) = id.parse::<Uuid>() else {
        return not_found(format!("invalid scraper id: {id}"));
    };
    match load_scraper_page(state.store.as_ref(), scraper_id).await {
        Ok(Some(page)) => render_html(page),
        Ok(None) => not_found(format!("scraper {scraper_id} not found")),
        Err(err) => server_error(err),
    }
}

async fn load_scraper_page(
    store: &dyn RunStore,
    scraper_id: Uuid,
) -> anyhow::Result<Option<ScraperPageTemplate>> {
    let Some(scraper) = store.get_scraper(scraper_id).await? else {
        return Ok(None);
    };
    let runs = store.list_runs(scraper_id, PAGE_LIST_LIMIT).await?;

    let mut alerts = Vec::new();
    for alert in store.list_alerts(scraper_id, PAGE_LIST_LIMIT).await? {
        let suggestions = store.list_repair_suggestions(alert.id).await?;
        alerts.push(AlertRow::new(&alert, &suggestions));
    }

    Ok(Some(ScraperPageTemplate {
        scraper: ScraperRow::from(&scraper),
        selectors: scraper
            .config
            .selectors
            .iter()
            .map(|(field, selector)| SelectorRow {
                field: field.clone(),
                selector: selector.clone(),
            })
            .collect(),
        runs: runs.iter().map(RunRow::from).collect(),
        alerts,
    }))
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn not_found(message: String) -> Response {
    match (NotFoundTemplate { message }).render() {
        Ok(html) => (StatusCode::NOT_FOUND, Html(html)).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    tracing::error!(error = %err, "page render failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {err}")),
    )
        .into_response()
}
