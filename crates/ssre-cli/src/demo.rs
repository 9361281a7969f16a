use std::collections::BTreeMap;

use anyhow::{Context, Result};
use scraper::{Html, Selector};
use serde_json::Value;
use ssre_client::{ClientConfig, SreClient};
use ssre_core::{Record, ScraperConfig};
use tracing::info;
use uuid::Uuid;

pub const HTML_V1: &str = r#"<html>
    <body>
        <div class="product">
            <h1>Cool Widget</h1>
            <span class="price">$19.99</span>
        </div>
    </body>
</html>
"#;

pub const HTML_V2: &str = r#"<html>
    <body>
        <div class="product">
            <h1>Cool Widget</h1>
            <span class="price-v2">$24.99</span>
        </div>
    </body>
</html>
"#;

#[derive(Debug, Clone)]
pub struct DemoReport {
    pub scraper_id: Uuid,
    pub first_run_items: usize,
    pub second_run_items: usize,
}

pub fn pricing_monitor() -> ScraperConfig {
    ScraperConfig {
        name: "Pricing Monitor".to_string(),
        target_url: "https://example.com/products".to_string(),
        selectors: BTreeMap::from([("price".to_string(), ".price".to_string())]),
    }
}

/// One record holding the text of the first match for each configured field.
/// Fields that do not match are left out; no matches at all yields no records.
pub fn extract(html: &str, selectors: &BTreeMap<String, String>) -> Vec<Record> {
    let document = Html::parse_document(html);
    let mut record = Record::new();
    for (field, css) in selectors {
        let Ok(selector) = Selector::parse(css) else {
            continue;
        };
        if let Some(element) = document.select(&selector).next() {
            let text = element.text().collect::<String>().trim().to_string();
            record.insert(field.clone(), Value::String(text));
        }
    }
    if record.is_empty() {
        Vec::new()
    } else {
        vec![record]
    }
}

pub async fn run(api_url: &str) -> Result<DemoReport> {
    let client = SreClient::new(ClientConfig::for_api_url(api_url)).context("building sre client")?;
    let scraper = client
        .register(&pricing_monitor())
        .await
        .context("registering demo scraper")?;
    info!(scraper_id = %scraper.id, "registered demo scraper");

    let observer = client.observer(scraper.id);
    let mut items = Vec::with_capacity(2);
    for (label, html) in [("v1-working", HTML_V1), ("v2-drifted", HTML_V2)] {
        let selectors = scraper.config.selectors.clone();
        let extracted = observer
            .monitor(|capture| async move {
                let records = extract(html, &selectors);
                capture.capture_data(records.clone());
                capture.capture_snapshot(html);
                Ok::<usize, anyhow::Error>(records.len())
            })
            .await?;
        info!(scraper_id = %scraper.id, run = label, items = extracted, "demo run reported");
        items.push(extracted);
    }

    Ok(DemoReport {
        scraper_id: scraper.id,
        first_run_items: items.first().copied().unwrap_or_default(),
        second_run_items: items.get(1).copied().unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn working_page_yields_the_price() {
        let records = extract(HTML_V1, &pricing_monitor().selectors);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["price"], "$19.99");
    }

    #[test]
    fn drifted_page_yields_nothing() {
        assert!(extract(HTML_V2, &pricing_monitor().selectors).is_empty());
    }

    #[test]
    fn unparsable_selectors_are_skipped() {
        let selectors = BTreeMap::from([
            ("price".to_string(), ".price".to_string()),
            ("broken".to_string(), "[[".to_string()),
        ]);
        let records = extract(HTML_V1, &selectors);
        assert_eq!(records.len(), 1);
        assert!(!records[0].contains_key("broken"));
    }
}
