//! Selector repair: implicated-field resolution, fix-prompt synthesis and the suggester boundary.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use scraper::{ElementRef, Html, Selector};
use ssre_core::{Alert, DriftType, RepairSuggestion, SchemaDiff, ScraperRun};
use ssre_storage::{RunStore, StoreError};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[cfg(any(test, feature = "test-util"))]
mod testing;
#[cfg(any(test, feature = "test-util"))]
pub use testing::RecordingSuggester;

pub const CRATE_NAME: &str = "ssre-repair";

/// Default cap on how much of the new page goes into a prompt.
pub const DEFAULT_NEW_DOM_CHAR_LIMIT: usize = 2000;

/// Old-context placeholder used when the broken selector matches nothing.
pub const ELEMENT_NOT_FOUND: &str = "Element not found";

/// Returned by [`StubRepairSuggester`] when it has no canned answer.
pub const UNABLE_TO_FIX: &str = "unable-to-fix";

#[derive(Debug, Error)]
pub enum RepairError {
    #[error("repair suggester failed: {0}")]
    Suggester(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outer HTML of the parent of the first element `selector` matches in `html`.
///
/// Never fails: an unparsable selector or a miss yields [`ELEMENT_NOT_FOUND`].
pub fn dom_context(html: &str, selector: &str) -> String {
    let Ok(selector) = Selector::parse(selector) else {
        return ELEMENT_NOT_FOUND.to_string();
    };
    let document = Html::parse_document(html);
    let Some(element) = document.select(&selector).next() else {
        return ELEMENT_NOT_FOUND.to_string();
    };
    // The root <html> element has the document node as parent, not an element.
    element
        .parent()
        .and_then(ElementRef::wrap)
        .unwrap_or(element)
        .html()
}

/// Whether `selector` parses and matches at least one element of `html`.
pub fn selector_matches(html: &str, selector: &str) -> bool {
    let Ok(selector) = Selector::parse(selector) else {
        return false;
    };
    Html::parse_document(html).select(&selector).next().is_some()
}

/// First `limit` characters of `text`, cut on a char boundary.
pub fn truncate_chars(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Builds repair prompts from an old/new snapshot pair.
#[derive(Debug, Clone, Copy)]
pub struct PromptSynthesizer {
    pub new_dom_char_limit: usize,
}

impl Default for PromptSynthesizer {
    fn default() -> Self {
        Self {
            new_dom_char_limit: DEFAULT_NEW_DOM_CHAR_LIMIT,
        }
    }
}

impl PromptSynthesizer {
    pub fn new(new_dom_char_limit: usize) -> Self {
        Self {
            new_dom_char_limit: new_dom_char_limit.max(1),
        }
    }

    pub fn synthesize(
        &self,
        old_html: &str,
        new_html: &str,
        broken_selector: &str,
        field_name: &str,
    ) -> String {
        let old_context = dom_context(old_html, broken_selector);
        let new_context = truncate_chars(new_html, self.new_dom_char_limit);

        format!(
            "You are repairing a web scraper. The CSS selector below stopped matching after the target page changed.\n\
             \n\
             Field name: {field_name}\n\
             Broken selector: {broken_selector}\n\
             \n\
             === OLD DOM CONTEXT (selector worked) ===\n\
             {old_context}\n\
             \n\
             === NEW DOM (current page) ===\n\
             {new_context}\n\
             \n\
             === TASK ===\n\
             1. Compare the old context with the new DOM.\n\
             2. Find the element in the new DOM that holds the same data as before.\n\
             3. Write a robust CSS selector that matches it.\n\
             4. Reply with the selector only.\n"
        )
    }
}

/// [`PromptSynthesizer::synthesize`] with the default truncation limit.
pub fn build_fix_prompt(
    old_html: &str,
    new_html: &str,
    broken_selector: &str,
    field_name: &str,
) -> String {
    PromptSynthesizer::default().synthesize(old_html, new_html, broken_selector, field_name)
}

/// Turns a repair prompt into a replacement selector.
#[async_trait]
pub trait RepairSuggester: Send + Sync {
    async fn suggest(&self, prompt: &str) -> Result<String, RepairError>;
}

/// Deterministic stand-in for an inference service; only knows the demo fixture.
#[derive(Debug, Default, Clone, Copy)]
pub struct StubRepairSuggester;

#[async_trait]
impl RepairSuggester for StubRepairSuggester {
    async fn suggest(&self, prompt: &str) -> Result<String, RepairError> {
        if prompt.contains(r#"class="price-v2""#) {
            Ok(".price-v2".to_string())
        } else {
            Ok(UNABLE_TO_FIX.to_string())
        }
    }
}

/// A configured field whose selector is suspected of causing the drift.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImplicatedField {
    pub field_name: String,
    pub selector: String,
}

/// Resolve which configured selectors an alert implicates.
///
/// Schema changes implicate fields that vanished from the first record and have
/// a configured selector. A null spike gives no partial signal, so every
/// configured field is implicated. Other classifications implicate nothing.
pub fn implicated_fields(
    drift_type: DriftType,
    current: &ScraperRun,
    baseline: &ScraperRun,
    selectors: &BTreeMap<String, String>,
) -> Vec<ImplicatedField> {
    let to_field = |(name, selector): (&String, &String)| ImplicatedField {
        field_name: name.clone(),
        selector: selector.clone(),
    };

    match drift_type {
        DriftType::SchemaChange => {
            let diff = SchemaDiff::between(current, baseline);
            diff.missing
                .iter()
                .filter_map(|key| selectors.get_key_value(key))
                .map(to_field)
                .collect()
        }
        DriftType::NullSpike => selectors.iter().map(to_field).collect(),
        DriftType::ValueDistribution | DriftType::RunFailed => Vec::new(),
    }
}

/// Resolves implicated fields for an alert and requests one fix per field.
pub struct RepairTrigger {
    store: Arc<dyn RunStore>,
    suggester: Arc<dyn RepairSuggester>,
    synthesizer: PromptSynthesizer,
}

impl RepairTrigger {
    pub fn new(store: Arc<dyn RunStore>, suggester: Arc<dyn RepairSuggester>) -> Self {
        Self {
            store,
            suggester,
            synthesizer: PromptSynthesizer::default(),
        }
    }

    pub fn with_synthesizer(mut self, synthesizer: PromptSynthesizer) -> Self {
        self.synthesizer = synthesizer;
        self
    }

    /// Generate and persist repair suggestions for `alert`.
    ///
    /// A missing scraper record aborts quietly with no suggestions. Fields are
    /// skipped when either snapshot is absent or the suggester fails for them.
    pub async fn trigger(
        &self,
        current: &ScraperRun,
        baseline: &ScraperRun,
        alert: &Alert,
    ) -> Result<Vec<RepairSuggestion>, RepairError> {
        let Some(scraper) = self.store.get_scraper(current.scraper_id).await? else {
            warn!(
                scraper_id = %current.scraper_id,
                alert_id = %alert.id,
                "scraper not found; skipping repair"
            );
            return Ok(Vec::new());
        };

        let fields = implicated_fields(alert.drift_type, current, baseline, &scraper.config.selectors);
        info!(
            alert_id = %alert.id,
            drift_type = %alert.drift_type,
            implicated = fields.len(),
            "triggering selector repair"
        );

        let mut suggestions = Vec::with_capacity(fields.len());
        for field in fields {
            let (Some(old_html), Some(new_html)) =
                (baseline.html_snapshot.as_deref(), current.html_snapshot.as_deref())
            else {
                debug!(field = %field.field_name, "snapshot missing; skipping field");
                continue;
            };

            let prompt = self
                .synthesizer
                .synthesize(old_html, new_html, &field.selector, &field.field_name);
            let suggested = match self.suggester.suggest(&prompt).await {
                Ok(suggested) => suggested.trim().to_string(),
                Err(err) => {
                    warn!(field = %field.field_name, error = %err, "repair suggester failed");
                    continue;
                }
            };

            let confidence_score = if selector_matches(new_html, &suggested) {
                1.0
            } else {
                0.0
            };
            let suggestion = RepairSuggestion {
                id: Uuid::new_v4(),
                alert_id: alert.id,
                diff_summary: format!("{} -> {}", field.selector, suggested),
                field_name: field.field_name,
                old_selector: field.selector,
                suggested_selector: suggested,
                confidence_score,
                created_at: Utc::now(),
            };
            self.store.save_repair_suggestion(&suggestion).await?;
            info!(
                alert_id = %alert.id,
                field = %suggestion.field_name,
                suggested = %suggestion.suggested_selector,
                confidence = suggestion.confidence_score,
                "repair suggestion recorded"
            );
            suggestions.push(suggestion);
        }

        Ok(suggestions)
    }
}
