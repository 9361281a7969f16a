//! Post-ingestion analysis: baseline lookup, drift detection, alert persistence and
//! repair dispatch, plus the executor seam used to run it in the background.

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::FutureExt;
use ssre_core::{Alert, RepairSuggestion, ScraperRun};
use ssre_repair::RepairTrigger;
use ssre_storage::RunStore;
use tracing::{error, info, warn};
use uuid::Uuid;

mod drift;
mod executor;

pub use drift::{detect_drift, NULL_SPIKE_MESSAGE};
pub use executor::{InlineExecutor, TaskExecutor, TokioExecutor};

pub const CRATE_NAME: &str = "ssre-pipeline";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Received,
    BaselineLookup,
    NoBaseline,
    DriftEvaluated,
    Alerted,
    RepairTriggered,
    Done,
}

impl Stage {
    fn as_str(self) -> &'static str {
        match self {
            Self::Received => "RECEIVED",
            Self::BaselineLookup => "BASELINE_LOOKUP",
            Self::NoBaseline => "NO_BASELINE",
            Self::DriftEvaluated => "DRIFT_EVALUATED",
            Self::Alerted => "ALERTED",
            Self::RepairTriggered => "REPAIR_TRIGGERED",
            Self::Done => "DONE",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisOutcome {
    /// No earlier successful run existed, so drift was not evaluated.
    NoBaseline,
    DriftEvaluated,
}

#[derive(Debug, Clone)]
pub struct AnalysisSummary {
    pub run_id: Uuid,
    pub baseline_run_id: Option<Uuid>,
    pub outcome: AnalysisOutcome,
    /// Every alert persisted for the run, in persistence order.
    pub alerts: Vec<Alert>,
    pub repair_suggestions: Vec<RepairSuggestion>,
}

pub struct AnalysisPipeline {
    store: Arc<dyn RunStore>,
    repair: RepairTrigger,
}

impl AnalysisPipeline {
    pub fn new(store: Arc<dyn RunStore>, repair: RepairTrigger) -> Self {
        Self { store, repair }
    }

    /// Analyze one persisted run against its baseline.
    ///
    /// Repair failures are logged and absorbed; store failures while persisting
    /// alerts abort the analysis.
    pub async fn analyze_run(&self, run: &ScraperRun) -> Result<AnalysisSummary> {
        log_stage(run, Stage::Received);

        log_stage(run, Stage::BaselineLookup);
        let baseline = self
            .store
            .get_last_successful_run(run.scraper_id, Some(run.id))
            .await
            .with_context(|| format!("looking up baseline for run {}", run.id))?;

        let mut summary = AnalysisSummary {
            run_id: run.id,
            baseline_run_id: baseline.as_ref().map(|b| b.id),
            outcome: AnalysisOutcome::NoBaseline,
            alerts: Vec::new(),
            repair_suggestions: Vec::new(),
        };

        match &baseline {
            None => log_stage(run, Stage::NoBaseline),
            Some(baseline) => {
                summary.outcome = AnalysisOutcome::DriftEvaluated;
                let alerts = detect_drift(run, Some(baseline));
                info!(
                    run_id = %run.id,
                    baseline_run_id = %baseline.id,
                    stage = %Stage::DriftEvaluated,
                    alerts = alerts.len(),
                    "drift evaluated"
                );

                for alert in alerts {
                    self.persist_alert(&alert).await?;
                    if alert.drift_type.triggers_repair() {
                        log_stage(run, Stage::RepairTriggered);
                        match self.repair.trigger(run, baseline, &alert).await {
                            Ok(suggestions) => summary.repair_suggestions.extend(suggestions),
                            Err(err) => warn!(
                                run_id = %run.id,
                                alert_id = %alert.id,
                                error = %err,
                                "repair trigger failed"
                            ),
                        }
                    }
                    summary.alerts.push(alert);
                }
            }
        }

        if !run.is_success() {
            let alert = Alert::run_failed(run);
            self.persist_alert(&alert).await?;
            summary.alerts.push(alert);
        }

        info!(
            run_id = %run.id,
            stage = %Stage::Done,
            alerts = summary.alerts.len(),
            suggestions = summary.repair_suggestions.len(),
            "analysis complete"
        );
        Ok(summary)
    }

    /// Hand the analysis of `run` to `executor`. Failures are logged, never returned.
    pub async fn schedule(self: Arc<Self>, executor: &dyn TaskExecutor, run: ScraperRun) {
        let task = async move {
            if let Err(err) = self.analyze_run(&run).await {
                error!(run_id = %run.id, scraper_id = %run.scraper_id, error = ?err, "run analysis failed");
            }
        };
        executor.submit(task.boxed()).await;
    }

    async fn persist_alert(&self, alert: &Alert) -> Result<()> {
        self.store
            .save_alert(alert)
            .await
            .with_context(|| format!("persisting {} alert for run {}", alert.drift_type, alert.run_id))?;
        info!(
            run_id = %alert.run_id,
            scraper_id = %alert.scraper_id,
            alert_id = %alert.id,
            drift_type = %alert.drift_type,
            severity = %alert.severity,
            stage = %Stage::Alerted,
            "alert raised"
        );
        Ok(())
    }
}

fn log_stage(run: &ScraperRun, stage: Stage) {
    info!(run_id = %run.id, scraper_id = %run.scraper_id, stage = %stage, "analysis stage");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use chrono::{Duration, Utc};
    use serde_json::json;
    use ssre_core::{DriftType, Record, RunStatus, RunSubmission, Scraper, ScraperConfig, Severity};
    use ssre_repair::{RecordingSuggester, RepairSuggester, StubRepairSuggester};
    use ssre_storage::MemoryRunStore;

    const HTML_V1: &str = r#"<html><body><div class="product"><h1>Cool Widget</h1><span class="price">$19.99</span></div></body></html>"#;
    const HTML_V2: &str = r#"<html><body><div class="product"><h1>Cool Widget</h1><span class="price-v2">$24.99</span></div></body></html>"#;

    struct Harness {
        store: Arc<dyn RunStore>,
        scraper: Scraper,
        pipeline: Arc<AnalysisPipeline>,
    }

    async fn harness(selectors: &[(&str, &str)], suggester: Arc<dyn RepairSuggester>) -> Harness {
        let store: Arc<dyn RunStore> = Arc::new(MemoryRunStore::new());
        let scraper = Scraper::register(ScraperConfig {
            name: "Pricing Monitor".into(),
            target_url: "https://example.com/products".into(),
            selectors: selectors
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        });
        store.create_scraper(&scraper).await.unwrap();
        let repair = RepairTrigger::new(store.clone(), suggester);
        let pipeline = Arc::new(AnalysisPipeline::new(store.clone(), repair));
        Harness {
            store,
            scraper,
            pipeline,
        }
    }

    impl Harness {
        async fn record(
            &self,
            status: RunStatus,
            sample: Vec<serde_json::Value>,
            snapshot: Option<&str>,
            age_secs: i64,
        ) -> ScraperRun {
            let mut submission = RunSubmission::pending(self.scraper.id);
            submission.status = status;
            submission.items_extracted = sample.len() as u64;
            submission.extracted_data_sample = Some(
                sample
                    .into_iter()
                    .map(|v| v.as_object().cloned().expect("object literal"))
                    .collect::<Vec<Record>>(),
            );
            submission.html_snapshot = snapshot.map(str::to_string);
            let mut run = submission.into_run();
            run.timestamp = Utc::now() - Duration::seconds(age_secs);
            self.store.save_run(&run).await.unwrap();
            run
        }
    }

    #[tokio::test]
    async fn null_spike_raises_one_alert_and_repairs_price() {
        let h = harness(&[("price", ".price")], Arc::new(StubRepairSuggester)).await;
        let baseline = h
            .record(RunStatus::Success, vec![json!({"price": "$19.99"})], Some(HTML_V1), 60)
            .await;
        let current = h.record(RunStatus::Success, vec![], Some(HTML_V2), 0).await;

        let summary = h.pipeline.analyze_run(&current).await.unwrap();

        assert_eq!(summary.outcome, AnalysisOutcome::DriftEvaluated);
        assert_eq!(summary.baseline_run_id, Some(baseline.id));
        assert_eq!(summary.alerts.len(), 1);
        assert_eq!(summary.alerts[0].drift_type, DriftType::NullSpike);
        assert_eq!(summary.repair_suggestions.len(), 1);
        assert_eq!(summary.repair_suggestions[0].field_name, "price");
        assert_eq!(summary.repair_suggestions[0].suggested_selector, ".price-v2");

        let stored = h.store.list_alerts(h.scraper.id, 20).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, summary.alerts[0].id);
    }

    #[tokio::test]
    async fn schema_change_repairs_configured_missing_field() {
        let suggester = Arc::new(RecordingSuggester::answering("h1"));
        let h = harness(&[("price", ".price"), ("title", "h1.title")], suggester.clone()).await;
        h.record(
            RunStatus::Success,
            vec![json!({"price": "$19.99", "title": "Widget"})],
            Some(HTML_V1),
            60,
        )
        .await;
        let current = h
            .record(RunStatus::Success, vec![json!({"price": "$24.99"})], Some(HTML_V2), 0)
            .await;

        let summary = h.pipeline.analyze_run(&current).await.unwrap();

        assert_eq!(summary.alerts.len(), 1);
        assert_eq!(summary.alerts[0].drift_type, DriftType::SchemaChange);
        assert_eq!(
            summary.alerts[0].message,
            "Schema changed. Missing keys: [title], Added keys: []"
        );
        let prompts = suggester.prompts();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("Field name: title"));
        assert_eq!(summary.repair_suggestions.len(), 1);
        assert_eq!(summary.repair_suggestions[0].field_name, "title");
    }

    #[tokio::test]
    async fn schema_change_skips_repair_for_unconfigured_field() {
        let suggester = Arc::new(RecordingSuggester::answering("h1"));
        let h = harness(&[("price", ".price")], suggester.clone()).await;
        h.record(
            RunStatus::Success,
            vec![json!({"price": "$19.99", "title": "Widget"})],
            Some(HTML_V1),
            60,
        )
        .await;
        let current = h
            .record(RunStatus::Success, vec![json!({"price": "$24.99"})], Some(HTML_V2), 0)
            .await;

        let summary = h.pipeline.analyze_run(&current).await.unwrap();
        assert_eq!(summary.alerts.len(), 1);
        assert!(summary.repair_suggestions.is_empty());
        assert!(suggester.prompts().is_empty());
    }

    #[tokio::test]
    async fn failure_without_baseline_still_alerts() {
        let h = harness(&[("price", ".price")], Arc::new(StubRepairSuggester)).await;
        let mut submission = RunSubmission::pending(h.scraper.id);
        submission.status = RunStatus::Failure;
        submission.error_message = Some("timeout".into());
        let run = submission.into_run();
        h.store.save_run(&run).await.unwrap();

        let summary = h.pipeline.analyze_run(&run).await.unwrap();

        assert_eq!(summary.outcome, AnalysisOutcome::NoBaseline);
        assert_eq!(summary.alerts.len(), 1);
        let alert = &summary.alerts[0];
        assert_eq!(alert.drift_type, DriftType::RunFailed);
        assert_eq!(alert.severity, Severity::High);
        assert!(alert.message.contains("timeout"));
        assert_eq!(h.store.list_alerts(h.scraper.id, 20).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_run_with_drift_gets_both_alerts() {
        let h = harness(&[("price", ".price")], Arc::new(StubRepairSuggester)).await;
        h.record(RunStatus::Success, vec![json!({"price": "$19.99"})], Some(HTML_V1), 60)
            .await;
        let mut submission = RunSubmission::pending(h.scraper.id);
        submission.status = RunStatus::Failure;
        submission.error_message = Some("timeout".into());
        submission.html_snapshot = Some(HTML_V2.into());
        let run = submission.into_run();
        h.store.save_run(&run).await.unwrap();

        let summary = h.pipeline.analyze_run(&run).await.unwrap();

        let kinds: Vec<_> = summary.alerts.iter().map(|a| a.drift_type).collect();
        assert_eq!(kinds, vec![DriftType::NullSpike, DriftType::RunFailed]);
        assert_eq!(summary.alerts[1].message, "Run failed: timeout");
        assert_eq!(summary.repair_suggestions.len(), 1);
    }

    #[tokio::test]
    async fn first_successful_run_has_no_baseline() {
        let h = harness(&[("price", ".price")], Arc::new(StubRepairSuggester)).await;
        let run = h
            .record(RunStatus::Success, vec![json!({"price": "$19.99"})], Some(HTML_V1), 0)
            .await;

        let summary = h.pipeline.analyze_run(&run).await.unwrap();
        assert_eq!(summary.outcome, AnalysisOutcome::NoBaseline);
        assert_eq!(summary.baseline_run_id, None);
        assert!(summary.alerts.is_empty());
    }

    #[tokio::test]
    async fn matching_schema_raises_nothing() {
        let h = harness(&[("price", ".price")], Arc::new(StubRepairSuggester)).await;
        h.record(RunStatus::Success, vec![json!({"price": "$19.99"})], None, 60)
            .await;
        let current = h
            .record(RunStatus::Success, vec![json!({"price": "$21.00"})], None, 0)
            .await;

        let summary = h.pipeline.analyze_run(&current).await.unwrap();
        assert_eq!(summary.outcome, AnalysisOutcome::DriftEvaluated);
        assert!(summary.alerts.is_empty());
        assert!(h.store.list_alerts(h.scraper.id, 20).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn null_spike_without_snapshots_alerts_but_skips_repair() {
        let suggester = Arc::new(RecordingSuggester::answering(".price-v2"));
        let h = harness(&[("price", ".price")], suggester.clone()).await;
        h.record(RunStatus::Success, vec![json!({"price": "$19.99"})], None, 60)
            .await;
        let current = h.record(RunStatus::Success, vec![], None, 0).await;

        let summary = h.pipeline.analyze_run(&current).await.unwrap();
        assert_eq!(summary.alerts.len(), 1);
        assert!(summary.repair_suggestions.is_empty());
        assert!(suggester.prompts().is_empty());
    }

    #[tokio::test]
    async fn scheduling_inline_completes_analysis_before_returning() {
        let h = harness(&[("price", ".price")], Arc::new(StubRepairSuggester)).await;
        h.record(RunStatus::Success, vec![json!({"price": "$19.99"})], Some(HTML_V1), 60)
            .await;
        let current = h.record(RunStatus::Success, vec![], Some(HTML_V2), 0).await;

        h.pipeline.clone().schedule(&InlineExecutor, current).await;

        let alerts = h.store.list_alerts(h.scraper.id, 20).await.unwrap();
        assert_eq!(alerts.len(), 1);
        let suggestions = h.store.list_repair_suggestions(alerts[0].id).await.unwrap();
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].suggested_selector, ".price-v2");
    }
}
