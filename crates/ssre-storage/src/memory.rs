use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ssre_core::{Alert, RepairSuggestion, Scraper, ScraperRun};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{RunStore, StoreError, StoreResult};

/// Process-local store for tests and demos. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    scrapers: Vec<Scraper>,
    runs: Vec<ScraperRun>,
    alerts: Vec<Alert>,
    suggestions: Vec<RepairSuggestion>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Descending by timestamp; equal timestamps keep the later insertion first.
fn newest_first<'a, T, I, F>(items: I, timestamp: F, limit: usize) -> Vec<T>
where
    T: Clone + 'a,
    I: DoubleEndedIterator<Item = &'a T>,
    F: Fn(&T) -> DateTime<Utc>,
{
    let mut out: Vec<T> = items.rev().cloned().collect();
    out.sort_by(|a, b| timestamp(b).cmp(&timestamp(a)));
    out.truncate(limit);
    out
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create_scraper(&self, scraper: &Scraper) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state.scrapers.iter().any(|s| s.id == scraper.id) {
            return Err(StoreError::Duplicate {
                kind: "scraper",
                id: scraper.id,
            });
        }
        state.scrapers.push(scraper.clone());
        Ok(())
    }

    async fn get_scraper(&self, scraper_id: Uuid) -> StoreResult<Option<Scraper>> {
        let state = self.state.lock().await;
        Ok(state.scrapers.iter().find(|s| s.id == scraper_id).cloned())
    }

    async fn list_scrapers(&self) -> StoreResult<Vec<Scraper>> {
        let state = self.state.lock().await;
        Ok(state.scrapers.clone())
    }

    async fn save_run(&self, run: &ScraperRun) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state.runs.iter().any(|r| r.id == run.id) {
            return Err(StoreError::Duplicate {
                kind: "run",
                id: run.id,
            });
        }
        state.runs.push(run.clone());
        Ok(())
    }

    async fn get_last_successful_run(
        &self,
        scraper_id: Uuid,
        exclude_run_id: Option<Uuid>,
    ) -> StoreResult<Option<ScraperRun>> {
        let state = self.state.lock().await;
        let candidates = state.runs.iter().filter(|r| {
            r.scraper_id == scraper_id && r.is_success() && Some(r.id) != exclude_run_id
        });
        Ok(newest_first(candidates, |r| r.timestamp, 1).into_iter().next())
    }

    async fn list_runs(&self, scraper_id: Uuid, limit: usize) -> StoreResult<Vec<ScraperRun>> {
        let state = self.state.lock().await;
        let runs = state.runs.iter().filter(|r| r.scraper_id == scraper_id);
        Ok(newest_first(runs, |r| r.timestamp, limit))
    }

    async fn save_alert(&self, alert: &Alert) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state.alerts.iter().any(|a| a.id == alert.id) {
            return Err(StoreError::Duplicate {
                kind: "alert",
                id: alert.id,
            });
        }
        state.alerts.push(alert.clone());
        Ok(())
    }

    async fn list_alerts(&self, scraper_id: Uuid, limit: usize) -> StoreResult<Vec<Alert>> {
        let state = self.state.lock().await;
        let alerts = state.alerts.iter().filter(|a| a.scraper_id == scraper_id);
        Ok(newest_first(alerts, |a| a.timestamp, limit))
    }

    async fn save_repair_suggestion(&self, suggestion: &RepairSuggestion) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state.suggestions.iter().any(|s| s.id == suggestion.id) {
            return Err(StoreError::Duplicate {
                kind: "repair suggestion",
                id: suggestion.id,
            });
        }
        state.suggestions.push(suggestion.clone());
        Ok(())
    }

    async fn list_repair_suggestions(&self, alert_id: Uuid) -> StoreResult<Vec<RepairSuggestion>> {
        let state = self.state.lock().await;
        Ok(state
            .suggestions
            .iter()
            .filter(|s| s.alert_id == alert_id)
            .cloned()
            .collect())
    }
}
