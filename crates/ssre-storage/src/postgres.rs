use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use ssre_core::{Alert, Record, RepairSuggestion, Scraper, ScraperConfig, ScraperRun};
use uuid::Uuid;

use crate::{RunStore, StoreError, StoreResult};

// Relative to crates/ssre-storage/Cargo.toml; resolves to <workspace-root>/migrations/
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, config: PoolConfig) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.acquire_timeout)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending migrations; returns how many were newly applied.
    pub async fn migrate(&self) -> StoreResult<usize> {
        let count_applied = || {
            sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM _sqlx_migrations WHERE success = true",
            )
            .fetch_one(&self.pool)
        };
        // The bookkeeping table does not exist on a fresh database.
        let before = count_applied().await.unwrap_or(0);
        MIGRATOR.run(&self.pool).await?;
        let after = count_applied().await.unwrap_or(before);
        Ok(usize::try_from((after - before).max(0)).unwrap_or(0))
    }
}

fn invalid(column: &'static str, reason: impl ToString) -> StoreError {
    StoreError::InvalidColumn {
        column,
        reason: reason.to_string(),
    }
}

/// Map a primary-key collision onto the same error the memory store reports.
fn insert_error(kind: &'static str, id: Uuid) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |err| match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Duplicate { kind, id },
        _ => StoreError::Sqlx(err),
    }
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn scraper_from_row(row: &PgRow) -> StoreResult<Scraper> {
    let selectors: Json<BTreeMap<String, String>> = row.try_get("selectors")?;
    Ok(Scraper {
        id: row.try_get("id")?,
        config: ScraperConfig {
            name: row.try_get("name")?,
            target_url: row.try_get("target_url")?,
            selectors: selectors.0,
        },
        created_at: row.try_get("created_at")?,
    })
}

fn run_from_row(row: &PgRow) -> StoreResult<ScraperRun> {
    let status: String = row.try_get("status")?;
    let items_extracted: i64 = row.try_get("items_extracted")?;
    let sample: Option<Json<Vec<Record>>> = row.try_get("extracted_data_sample")?;
    Ok(ScraperRun {
        id: row.try_get("id")?,
        scraper_id: row.try_get("scraper_id")?,
        timestamp: row.try_get("recorded_at")?,
        status: status.parse().map_err(|e| invalid("status", e))?,
        duration_ms: row.try_get("duration_ms")?,
        items_extracted: u64::try_from(items_extracted).map_err(|e| invalid("items_extracted", e))?,
        error_message: row.try_get("error_message")?,
        extracted_data_sample: sample.map(|json| json.0),
        html_snapshot: row.try_get("html_snapshot")?,
    })
}

fn alert_from_row(row: &PgRow) -> StoreResult<Alert> {
    let drift_type: String = row.try_get("drift_type")?;
    let severity: String = row.try_get("severity")?;
    Ok(Alert {
        id: row.try_get("id")?,
        scraper_id: row.try_get("scraper_id")?,
        run_id: row.try_get("run_id")?,
        drift_type: drift_type.parse().map_err(|e| invalid("drift_type", e))?,
        message: row.try_get("message")?,
        severity: severity.parse().map_err(|e| invalid("severity", e))?,
        timestamp: row.try_get("raised_at")?,
    })
}

fn suggestion_from_row(row: &PgRow) -> StoreResult<RepairSuggestion> {
    Ok(RepairSuggestion {
        id: row.try_get("id")?,
        alert_id: row.try_get("alert_id")?,
        field_name: row.try_get("field_name")?,
        old_selector: row.try_get("old_selector")?,
        suggested_selector: row.try_get("suggested_selector")?,
        confidence_score: row.try_get("confidence_score")?,
        diff_summary: row.try_get("diff_summary")?,
        created_at: row.try_get("created_at")?,
    })
}

const RUN_COLUMNS: &str = "id, scraper_id, recorded_at, status, duration_ms, items_extracted, \
                           error_message, extracted_data_sample, html_snapshot";

#[async_trait]
impl RunStore for PgRunStore {
    async fn create_scraper(&self, scraper: &Scraper) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO scrapers (id, name, target_url, selectors, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(scraper.id)
        .bind(&scraper.config.name)
        .bind(&scraper.config.target_url)
        .bind(Json(&scraper.config.selectors))
        .bind(scraper.created_at)
        .execute(&self.pool)
        .await
        .map_err(insert_error("scraper", scraper.id))?;
        Ok(())
    }

    async fn get_scraper(&self, scraper_id: Uuid) -> StoreResult<Option<Scraper>> {
        let row = sqlx::query(
            "SELECT id, name, target_url, selectors, created_at FROM scrapers WHERE id = $1",
        )
        .bind(scraper_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(scraper_from_row).transpose()
    }

    async fn list_scrapers(&self) -> StoreResult<Vec<Scraper>> {
        let rows = sqlx::query(
            "SELECT id, name, target_url, selectors, created_at FROM scrapers ORDER BY seq",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(scraper_from_row).collect()
    }

    async fn save_run(&self, run: &ScraperRun) -> StoreResult<()> {
        let items_extracted =
            i64::try_from(run.items_extracted).map_err(|e| invalid("items_extracted", e))?;
        sqlx::query(
            r#"
            INSERT INTO runs (id, scraper_id, recorded_at, status, duration_ms, items_extracted,
                              error_message, extracted_data_sample, html_snapshot)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(run.id)
        .bind(run.scraper_id)
        .bind(run.timestamp)
        .bind(run.status.as_str())
        .bind(run.duration_ms)
        .bind(items_extracted)
        .bind(&run.error_message)
        .bind(run.extracted_data_sample.as_ref().map(Json))
        .bind(&run.html_snapshot)
        .execute(&self.pool)
        .await
        .map_err(insert_error("run", run.id))?;
        Ok(())
    }

    async fn get_last_successful_run(
        &self,
        scraper_id: Uuid,
        exclude_run_id: Option<Uuid>,
    ) -> StoreResult<Option<ScraperRun>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM runs \
              WHERE scraper_id = $1 AND status = 'SUCCESS' \
                AND ($2::uuid IS NULL OR id <> $2) \
              ORDER BY recorded_at DESC, seq DESC \
              LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(scraper_id)
            .bind(exclude_run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn list_runs(&self, scraper_id: Uuid, limit: usize) -> StoreResult<Vec<ScraperRun>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE scraper_id = $1 \
              ORDER BY recorded_at DESC, seq DESC LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(scraper_id)
            .bind(limit_param(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn save_alert(&self, alert: &Alert) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO alerts (id, scraper_id, run_id, drift_type, message, severity, raised_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(alert.id)
        .bind(alert.scraper_id)
        .bind(alert.run_id)
        .bind(alert.drift_type.as_str())
        .bind(&alert.message)
        .bind(alert.severity.as_str())
        .bind(alert.timestamp)
        .execute(&self.pool)
        .await
        .map_err(insert_error("alert", alert.id))?;
        Ok(())
    }

    async fn list_alerts(&self, scraper_id: Uuid, limit: usize) -> StoreResult<Vec<Alert>> {
        let rows = sqlx::query(
            r#"
            SELECT id, scraper_id, run_id, drift_type, message, severity, raised_at
              FROM alerts
             WHERE scraper_id = $1
             ORDER BY raised_at DESC, seq DESC
             LIMIT $2
            "#,
        )
        .bind(scraper_id)
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(alert_from_row).collect()
    }

    async fn save_repair_suggestion(&self, suggestion: &RepairSuggestion) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO repair_suggestions (id, alert_id, field_name, old_selector,
                                            suggested_selector, confidence_score,
                                            diff_summary, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(suggestion.id)
        .bind(suggestion.alert_id)
        .bind(&suggestion.field_name)
        .bind(&suggestion.old_selector)
        .bind(&suggestion.suggested_selector)
        .bind(suggestion.confidence_score)
        .bind(&suggestion.diff_summary)
        .bind(suggestion.created_at)
        .execute(&self.pool)
        .await
        .map_err(insert_error("repair suggestion", suggestion.id))?;
        Ok(())
    }

    async fn list_repair_suggestions(&self, alert_id: Uuid) -> StoreResult<Vec<RepairSuggestion>> {
        let rows = sqlx::query(
            r#"
            SELECT id, alert_id, field_name, old_selector, suggested_selector,
                   confidence_score, diff_summary, created_at
              FROM repair_suggestions
             WHERE alert_id = $1
             ORDER BY seq
            "#,
        )
        .bind(alert_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(suggestion_from_row).collect()
    }
}
