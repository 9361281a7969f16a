//! Core domain model for Scraper SRE: scrapers, runs, alerts and repair suggestions.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

mod config;

pub use config::{build_app_config, load_app_config_from_env, AppConfig, ConfigError, StoreBackend};

pub const CRATE_NAME: &str = "ssre-core";

/// One extracted item: field name -> scraped value.
pub type Record = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Error, PartialEq)]
pub enum CoreError {
    #[error("items_extracted is {declared} but the sample holds {sample_len} records")]
    ItemCountMismatch { declared: u64, sample_len: usize },
    #[error("duration_ms must be a finite, non-negative number (got {0})")]
    InvalidDuration(f64),
    #[error("{0} must not be empty")]
    EmptyField(&'static str),
    #[error("unknown {kind} value {value:?}")]
    UnknownVariant { kind: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Success,
    Failure,
}

/// Drift classification attached to an alert.
///
/// `ValueDistribution` is reserved: nothing emits it. Failed runs are reported
/// as `RunFailed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriftType {
    SchemaChange,
    ValueDistribution,
    NullSpike,
    RunFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    High,
    Medium,
    Low,
}

macro_rules! wire_enum {
    ($ty:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(CoreError::UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

wire_enum!(RunStatus, "run status", {
    Success => "SUCCESS",
    Failure => "FAILURE",
});

wire_enum!(DriftType, "drift type", {
    SchemaChange => "SCHEMA_CHANGE",
    ValueDistribution => "VALUE_DISTRIBUTION",
    NullSpike => "NULL_SPIKE",
    RunFailed => "RUN_FAILED",
});

wire_enum!(Severity, "severity", {
    High => "HIGH",
    Medium => "MEDIUM",
    Low => "LOW",
});

impl DriftType {
    /// Whether an alert of this type should be handed to the repair trigger.
    pub fn triggers_repair(self) -> bool {
        matches!(self, DriftType::SchemaChange | DriftType::NullSpike)
    }
}

/// Registration payload: what to scrape and how each field is extracted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScraperConfig {
    pub name: String,
    pub target_url: String,
    /// Field name -> CSS selector, e.g. `{"price": ".price"}`.
    pub selectors: BTreeMap<String, String>,
}

impl ScraperConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.name.trim().is_empty() {
            return Err(CoreError::EmptyField("name"));
        }
        if self.target_url.trim().is_empty() {
            return Err(CoreError::EmptyField("target_url"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scraper {
    pub id: Uuid,
    #[serde(flatten)]
    pub config: ScraperConfig,
    pub created_at: DateTime<Utc>,
}

impl Scraper {
    pub fn register(config: ScraperConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            config,
            created_at: Utc::now(),
        }
    }
}

/// One execution of a monitored scraping job. Immutable once persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScraperRun {
    pub id: Uuid,
    pub scraper_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub status: RunStatus,
    pub duration_ms: f64,
    pub items_extracted: u64,
    pub error_message: Option<String>,
    pub extracted_data_sample: Option<Vec<Record>>,
    pub html_snapshot: Option<String>,
}

impl ScraperRun {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    /// Extracted records, treating an absent sample as empty.
    pub fn sample(&self) -> &[Record] {
        self.extracted_data_sample.as_deref().unwrap_or_default()
    }

    pub fn has_sample(&self) -> bool {
        !self.sample().is_empty()
    }

    /// Key set of the first sampled record. Empty when there is no sample.
    pub fn first_record_keys(&self) -> BTreeSet<String> {
        self.sample()
            .first()
            .map(|record| record.keys().cloned().collect())
            .unwrap_or_default()
    }
}

/// Key-set difference between the first records of two runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaDiff {
    /// Present in the baseline, gone from the current run.
    pub missing: BTreeSet<String>,
    /// New in the current run.
    pub added: BTreeSet<String>,
}

impl SchemaDiff {
    pub fn between(current: &ScraperRun, baseline: &ScraperRun) -> Self {
        let current_keys = current.first_record_keys();
        let baseline_keys = baseline.first_record_keys();
        Self {
            missing: baseline_keys.difference(&current_keys).cloned().collect(),
            added: current_keys.difference(&baseline_keys).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.added.is_empty()
    }
}

/// Ingestion payload as produced by the client instrumentation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSubmission {
    pub scraper_id: Uuid,
    pub status: RunStatus,
    pub duration_ms: f64,
    pub items_extracted: u64,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub extracted_data_sample: Option<Vec<Record>>,
    #[serde(default)]
    pub html_snapshot: Option<String>,
}

impl RunSubmission {
    /// A fresh submission for `scraper_id`, successful until told otherwise.
    pub fn pending(scraper_id: Uuid) -> Self {
        Self {
            scraper_id,
            status: RunStatus::Success,
            duration_ms: 0.0,
            items_extracted: 0,
            error_message: None,
            extracted_data_sample: None,
            html_snapshot: None,
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if !self.duration_ms.is_finite() || self.duration_ms < 0.0 {
            return Err(CoreError::InvalidDuration(self.duration_ms));
        }
        if let Some(sample) = &self.extracted_data_sample {
            if sample.len() as u64 != self.items_extracted {
                return Err(CoreError::ItemCountMismatch {
                    declared: self.items_extracted,
                    sample_len: sample.len(),
                });
            }
        }
        Ok(())
    }

    /// Stamp the submission with a new run id and the current time.
    pub fn into_run(self) -> ScraperRun {
        ScraperRun {
            id: Uuid::new_v4(),
            scraper_id: self.scraper_id,
            timestamp: Utc::now(),
            status: self.status,
            duration_ms: self.duration_ms,
            items_extracted: self.items_extracted,
            error_message: self.error_message,
            extracted_data_sample: self.extracted_data_sample,
            html_snapshot: self.html_snapshot,
        }
    }
}

/// Ingestion response: the run is stored, analysis is only scheduled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestAck {
    pub run_id: Uuid,
    pub status: String,
}

impl IngestAck {
    pub fn processing(run_id: Uuid) -> Self {
        Self {
            run_id,
            status: "processing".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub scraper_id: Uuid,
    pub run_id: Uuid,
    #[serde(rename = "type")]
    pub drift_type: DriftType,
    pub message: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn for_run(
        run: &ScraperRun,
        drift_type: DriftType,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            scraper_id: run.scraper_id,
            run_id: run.id,
            drift_type,
            message: message.into(),
            severity,
            timestamp: Utc::now(),
        }
    }

    /// The generic "this run failed" alert, carrying the run's error text.
    pub fn run_failed(run: &ScraperRun) -> Self {
        let error = run.error_message.as_deref().unwrap_or("unknown error");
        Self::for_run(
            run,
            DriftType::RunFailed,
            Severity::High,
            format!("Run failed: {error}"),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairSuggestion {
    pub id: Uuid,
    pub alert_id: Uuid,
    pub field_name: String,
    pub old_selector: String,
    pub suggested_selector: String,
    pub confidence_score: f64,
    pub diff_summary: String,
    pub created_at: DateTime<Utc>,
}
