//! Prometheus metric families published by the exporter.
//!
//! The sink owns its own [`Registry`] rather than using the process-global
//! default one, so tests and multiple exporters never share state.

use anyhow::{Context, Result};
use prometheus::{
    opts, CounterVec, Encoder, Gauge, GaugeVec, IntCounterVec, IntGauge, Registry, TextEncoder,
};

use crate::models::Measure;

const USAGE_LABELS: &[&str] = &[
    "model",
    "operation",
    "project_id",
    "project_name",
    "user_id",
    "api_key_id",
    "batch",
];

const COST_LABELS: &[&str] = &[
    "date",
    "project_id",
    "project_name",
    "line_item",
    "organization_id",
    "currency",
];

/// Label values shared by every usage series of one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageLabels {
    pub model: String,
    pub operation: String,
    pub project_id: String,
    pub project_name: String,
    pub user_id: String,
    pub api_key_id: String,
    pub batch: String,
}

impl UsageLabels {
    fn values(&self) -> [&str; 7] {
        [
            self.model.as_str(),
            self.operation.as_str(),
            self.project_id.as_str(),
            self.project_name.as_str(),
            self.user_id.as_str(),
            self.api_key_id.as_str(),
            self.batch.as_str(),
        ]
    }
}

/// Label values of one daily cost line item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CostLabels {
    pub date: String,
    pub project_id: String,
    pub project_name: String,
    pub line_item: String,
    pub organization_id: String,
    pub currency: String,
}

impl CostLabels {
    fn values(&self) -> [&str; 6] {
        [
            self.date.as_str(),
            self.project_id.as_str(),
            self.project_name.as_str(),
            self.line_item.as_str(),
            self.organization_id.as_str(),
            self.currency.as_str(),
        ]
    }
}

pub struct MetricsSink {
    registry: Registry,
    tokens: CounterVec,
    requests: CounterVec,
    daily_cost: GaugeVec,
    scrape_errors: IntCounterVec,
    anomalies: IntCounterVec,
    last_scrape: Gauge,
    ledger_entries: IntGauge,
}

impl MetricsSink {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let mut token_labels = USAGE_LABELS.to_vec();
        token_labels.push("token_type");
        let tokens = CounterVec::new(
            opts!("openai_api_tokens_total", "Total number of tokens used, by token type"),
            &token_labels,
        )?;
        let requests = CounterVec::new(
            opts!("openai_api_requests_total", "Total number of model requests"),
            USAGE_LABELS,
        )?;
        let daily_cost = GaugeVec::new(
            opts!("openai_api_daily_cost", "Cost incurred per day, project and line item"),
            COST_LABELS,
        )?;
        let scrape_errors = IntCounterVec::new(
            opts!(
                "openai_exporter_scrape_errors_total",
                "Failed collection cycles by operation"
            ),
            &["operation"],
        )?;
        let anomalies = IntCounterVec::new(
            opts!(
                "openai_exporter_usage_anomalies_total",
                "Buckets whose upstream value decreased after being published"
            ),
            &["operation"],
        )?;
        let last_scrape = Gauge::with_opts(opts!(
            "openai_exporter_last_scrape_timestamp_seconds",
            "Unix time of the last fully successful usage cycle"
        ))?;
        let ledger_entries = IntGauge::with_opts(opts!(
            "openai_exporter_ledger_entries",
            "Buckets currently tracked by the deduplication ledger"
        ))?;

        registry.register(Box::new(tokens.clone()))?;
        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(daily_cost.clone()))?;
        registry.register(Box::new(scrape_errors.clone()))?;
        registry.register(Box::new(anomalies.clone()))?;
        registry.register(Box::new(last_scrape.clone()))?;
        registry.register(Box::new(ledger_entries.clone()))?;

        Ok(Self {
            registry,
            tokens,
            requests,
            daily_cost,
            scrape_errors,
            anomalies,
            last_scrape,
            ledger_entries,
        })
    }

    /// Add `amount` to the series of `measure`. Negative or zero amounts are
    /// ignored; counters only move forward.
    pub fn add_usage(&self, labels: &UsageLabels, measure: Measure, amount: f64) {
        if amount <= 0.0 {
            return;
        }

        let values = labels.values();
        if measure.is_token() {
            let mut with_type = values.to_vec();
            with_type.push(measure.as_str());
            self.tokens.with_label_values(&with_type).inc_by(amount);
        } else {
            self.requests.with_label_values(&values).inc_by(amount);
        }
    }

    /// Overwrite the cost gauge for one line item.
    pub fn set_cost(&self, labels: &CostLabels, value: f64) {
        self.daily_cost
            .with_label_values(&labels.values())
            .set(value);
    }

    pub fn record_scrape_error(&self, operation: &str) {
        self.scrape_errors.with_label_values(&[operation]).inc();
    }

    pub fn record_anomalies(&self, operation: &str, count: usize) {
        if count > 0 {
            self.anomalies
                .with_label_values(&[operation])
                .inc_by(count as u64);
        }
    }

    pub fn set_last_scrape(&self, timestamp: i64) {
        self.last_scrape.set(timestamp as f64);
    }

    pub fn set_ledger_entries(&self, entries: usize) {
        self.ledger_entries.set(entries as i64);
    }

    /// Current value of a token counter, mainly for tests.
    pub fn token_total(&self, labels: &UsageLabels, measure: Measure) -> f64 {
        let mut values = labels.values().to_vec();
        if measure.is_token() {
            values.push(measure.as_str());
            self.tokens.with_label_values(&values).get()
        } else {
            self.requests.with_label_values(&values).get()
        }
    }

    pub fn cost(&self, labels: &CostLabels) -> f64 {
        self.daily_cost
            .with_label_values(&labels.values())
            .get()
    }

    /// Render every family in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .context("Failed to encode metrics")?;
        String::from_utf8(buffer).context("Metrics output was not valid UTF-8")
    }
}
