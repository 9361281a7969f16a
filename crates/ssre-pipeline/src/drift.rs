use std::collections::BTreeSet;

use ssre_core::{Alert, DriftType, SchemaDiff, ScraperRun, Severity};

pub const NULL_SPIKE_MESSAGE: &str = "Extracted 0 items, but previous run extracted items.";

/// Compare a run against its baseline and return the drift alerts it raises.
///
/// Checks run in order and stop at the first hit: no baseline, null spike,
/// missing sample on either side, then first-record schema comparison. Only
/// the first record of each sample is inspected.
pub fn detect_drift(current: &ScraperRun, baseline: Option<&ScraperRun>) -> Vec<Alert> {
    let Some(baseline) = baseline else {
        return Vec::new();
    };

    if !current.has_sample() && baseline.has_sample() {
        return vec![Alert::for_run(
            current,
            DriftType::NullSpike,
            Severity::High,
            NULL_SPIKE_MESSAGE,
        )];
    }

    if !current.has_sample() || !baseline.has_sample() {
        return Vec::new();
    }

    let diff = SchemaDiff::between(current, baseline);
    if diff.is_empty() {
        return Vec::new();
    }

    vec![Alert::for_run(
        current,
        DriftType::SchemaChange,
        Severity::High,
        schema_change_message(&diff),
    )]
}

fn schema_change_message(diff: &SchemaDiff) -> String {
    format!(
        "Schema changed. Missing keys: {}, Added keys: {}",
        render_keys(&diff.missing),
        render_keys(&diff.added)
    )
}

fn render_keys(keys: &BTreeSet<String>) -> String {
    let joined = keys.iter().map(String::as_str).collect::<Vec<_>>().join(", ");
    format!("[{joined}]")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use ssre_core::{Record, RunSubmission};
    use uuid::Uuid;

    fn run_with(sample: Option<Vec<serde_json::Value>>) -> ScraperRun {
        let mut submission = RunSubmission::pending(Uuid::nil());
        submission.extracted_data_sample = sample.map(|records| {
            records
                .into_iter()
                .map(|v| v.as_object().cloned().expect("object literal"))
                .collect::<Vec<Record>>()
        });
        submission.into_run()
    }

    fn strip(alerts: &[Alert]) -> Vec<(DriftType, Severity, String)> {
        alerts
            .iter()
            .map(|a| (a.drift_type, a.severity, a.message.clone()))
            .collect()
    }

    #[test]
    fn no_baseline_never_alerts() {
        for sample in [None, Some(vec![]), Some(vec![json!({"price": "$1"})])] {
            assert!(detect_drift(&run_with(sample), None).is_empty());
        }
    }

    #[test]
    fn empty_candidate_against_populated_baseline_is_a_null_spike() {
        let baseline = run_with(Some(vec![json!({"price": "$19.99"})]));
        for sample in [None, Some(vec![])] {
            let current = run_with(sample);
            let alerts = detect_drift(&current, Some(&baseline));
            assert_eq!(alerts.len(), 1);
            assert_eq!(alerts[0].drift_type, DriftType::NullSpike);
            assert_eq!(alerts[0].severity, Severity::High);
            assert_eq!(alerts[0].message, NULL_SPIKE_MESSAGE);
            assert_eq!(alerts[0].run_id, current.id);
        }
    }

    #[test]
    fn both_sides_empty_is_not_drift() {
        let baseline = run_with(Some(vec![]));
        assert!(detect_drift(&run_with(None), Some(&baseline)).is_empty());
        assert!(detect_drift(&run_with(Some(vec![])), Some(&baseline)).is_empty());
    }

    #[test]
    fn populated_candidate_against_empty_baseline_is_not_drift() {
        let baseline = run_with(None);
        let current = run_with(Some(vec![json!({"price": "$1"})]));
        assert!(detect_drift(&current, Some(&baseline)).is_empty());
    }

    #[test]
    fn equal_first_record_keys_are_not_drift() {
        let baseline = run_with(Some(vec![json!({"price": "$19.99", "title": "Widget"})]));
        let current = run_with(Some(vec![
            json!({"title": "Other", "price": "$5"}),
            json!({"unrelated": true}),
        ]));
        assert!(detect_drift(&current, Some(&baseline)).is_empty());
    }

    #[test]
    fn schema_change_lists_missing_and_added_keys() {
        let baseline = run_with(Some(vec![json!({"price": "$19.99", "title": "Widget"})]));
        let current = run_with(Some(vec![json!({"price": "$24.99"})]));
        let alerts = detect_drift(&current, Some(&baseline));
        assert_eq!(
            strip(&alerts),
            vec![(
                DriftType::SchemaChange,
                Severity::High,
                "Schema changed. Missing keys: [title], Added keys: []".to_string()
            )]
        );
    }

    #[test]
    fn schema_message_is_order_independent() {
        let baseline = run_with(Some(vec![json!({"c": 1, "a": 1, "b": 1})]));
        let current = run_with(Some(vec![json!({"z": 1, "b": 1, "y": 1})]));
        let alerts = detect_drift(&current, Some(&baseline));
        assert_eq!(
            alerts[0].message,
            "Schema changed. Missing keys: [a, c], Added keys: [y, z]"
        );
    }

    #[test]
    fn detection_is_repeatable() {
        let baseline = run_with(Some(vec![json!({"price": "$19.99", "title": "Widget"})]));
        let current = run_with(Some(vec![json!({"price": "$24.99", "sku": "A1"})]));
        let first = detect_drift(&current, Some(&baseline));
        let second = detect_drift(&current, Some(&baseline));
        assert_eq!(strip(&first), strip(&second));
    }
}
