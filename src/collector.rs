//! Collection scheduling
//!
//! Two independent loops drive the exporter:
//!
//! - **usage**: every scrape interval, fetch the window
//!   `[cursor - query_offset, now)` for every resource type concurrently, feed
//!   each record through the [`Ledger`] and publish the increments. The cursor
//!   only advances when every resource type succeeded, so a failed cycle is
//!   covered again by the next, wider window.
//! - **costs**: on a much longer period, fetch day-granularity costs and
//!   overwrite the cost gauge.
//!
//! Both loops stop between cycles when the [`CancellationToken`] fires.

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use futures::future::join_all;
use futures::TryStreamExt;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

use crate::client::{ClientError, UsageClient, USAGE_BUCKET_SECS};
use crate::config::Config;
use crate::dedup::Ledger;
use crate::metrics::{CostLabels, MetricsSink, UsageLabels};
use crate::models::{dimension, ResourceType, UsageRecord, UNKNOWN};
use crate::resolver::NameResolver;

/// Extra days of cost data re-fetched so late revisions of yesterday land.
const COST_LOOKBACK_DAYS: i64 = 1;

/// Half-open `[start, end)` fetch window in unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageWindow {
    pub start: i64,
    pub end: i64,
}

impl UsageWindow {
    /// Window for the next cycle. Starts `query_offset` before the cursor (or
    /// before `now` on the first cycle) but never further back than
    /// `max_lookback`, which keeps every fetched bucket inside ledger retention.
    ///
    /// The start is floored to a bucket boundary so upstream bucket starts,
    /// and with them ledger keys, are the same on every cycle.
    pub fn next(cursor: Option<i64>, now: i64, query_offset: i64, max_lookback: i64) -> Self {
        let anchor = cursor.map_or(now, |c| c.min(now));
        let start = (anchor - query_offset).max(now - max_lookback);
        Self {
            start: start - start.rem_euclid(USAGE_BUCKET_SECS),
            end: now,
        }
    }
}

/// Midnight-to-midnight UTC bounds of the day containing `at`.
pub fn day_bounds_utc<Tz: TimeZone>(at: &DateTime<Tz>) -> (i64, i64) {
    let day = at.with_timezone(&Utc).date_naive();
    let start = day
        .and_hms_opt(0, 0, 0)
        .map(|d| d.and_utc().timestamp())
        .unwrap_or_default();
    (start, start + ChronoDuration::days(1).num_seconds())
}

/// Per-resource outcome of one usage cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceReport {
    pub buckets: usize,
    pub records: usize,
    pub increments: usize,
    pub anomalies: usize,
}

#[derive(Debug, Default)]
pub struct CycleReport {
    pub succeeded: Vec<(ResourceType, ResourceReport)>,
    pub failed: Vec<(ResourceType, String)>,
}

impl CycleReport {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

/// The aggregation engine: client, ledger, resolver and sink wired together.
pub struct Exporter {
    client: UsageClient,
    ledger: Arc<Ledger>,
    resolver: Arc<NameResolver>,
    sink: Arc<MetricsSink>,
    organization_id: String,
    resources: Vec<ResourceType>,
}

impl Exporter {
    pub fn new(
        client: UsageClient,
        ledger: Arc<Ledger>,
        resolver: Arc<NameResolver>,
        sink: Arc<MetricsSink>,
        organization_id: String,
        resources: Vec<ResourceType>,
    ) -> Self {
        Self {
            client,
            ledger,
            resolver,
            sink,
            organization_id,
            resources,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn sink(&self) -> &MetricsSink {
        &self.sink
    }

    /// Run one usage cycle across every resource type and wait for all of
    /// them. `now` decides which buckets are still open.
    pub async fn collect_usage(self: &Arc<Self>, window: UsageWindow, now: i64) -> CycleReport {
        let tasks = self.resources.iter().map(|&resource| {
            let exporter = Arc::clone(self);
            let span = info_span!("resource", operation = %resource);
            tokio::spawn(
                async move { exporter.collect_resource(resource, window, now).await }
                    .instrument(span),
            )
        });
        let joined = join_all(tasks).await;

        let mut report = CycleReport::default();
        for (&resource, outcome) in self.resources.iter().zip(joined) {
            match task_outcome(outcome) {
                Ok(summary) => {
                    info!(
                        operation = %resource,
                        buckets = summary.buckets,
                        records = summary.records,
                        increments = summary.increments,
                        anomalies = summary.anomalies,
                        "Collected usage"
                    );
                    report.succeeded.push((resource, summary));
                }
                Err(e) => {
                    error!(operation = %resource, error = %e, "Usage collection failed");
                    self.sink.record_scrape_error(resource.as_str());
                    report.failed.push((resource, e));
                }
            }
        }

        report
    }

    /// Fetch one resource type page by page and publish its increments.
    /// Pages already applied stay applied if a later page fails.
    pub async fn collect_resource(
        &self,
        resource: ResourceType,
        window: UsageWindow,
        now: i64,
    ) -> Result<ResourceReport, ClientError> {
        let mut report = ResourceReport::default();
        let mut pages = pin!(self.client.usage_pages(resource, window.start, window.end));

        while let Some(page) = pages.try_next().await? {
            for bucket in page {
                report.buckets += 1;
                for record in bucket.records(resource) {
                    report.records += 1;
                    let (increments, anomalies) = self.apply(&record, now).await;
                    report.increments += increments;
                    report.anomalies += anomalies;
                }
            }
        }

        self.sink.record_anomalies(resource.as_str(), report.anomalies);
        Ok(report)
    }

    async fn apply(&self, record: &UsageRecord, now: i64) -> (usize, usize) {
        let delta = self.ledger.observe_record(record, now);
        if delta.increments.is_empty() {
            return (0, delta.regressions);
        }

        let labels = UsageLabels {
            model: record.model.clone(),
            operation: record.operation.as_str().to_string(),
            project_id: record.project_id.clone(),
            project_name: self.resolver.resolve(&record.project_id).await,
            user_id: record.user_id.clone(),
            api_key_id: record.api_key_id.clone(),
            batch: record.batch.clone(),
        };

        for (measure, amount) in &delta.increments {
            self.sink.add_usage(&labels, *measure, *amount);
        }

        (delta.increments.len(), delta.regressions)
    }

    /// Fetch daily costs for the UTC day containing `now` (plus the lookback)
    /// and overwrite the cost gauge. Returns the number of line items set.
    pub async fn collect_costs(&self, now: DateTime<Utc>) -> Result<usize, ClientError> {
        let (day_start, day_end) = day_bounds_utc(&now);
        let start = day_start - ChronoDuration::days(COST_LOOKBACK_DAYS).num_seconds();
        let buckets = self.client.fetch_costs(start, day_end).await?;

        let mut line_items = 0;
        for bucket in buckets {
            let date = DateTime::from_timestamp(bucket.start_time, 0)
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_else(|| UNKNOWN.to_string());

            for result in bucket.results {
                let Some(amount) = result.amount else {
                    debug!(date = %date, "Skipping cost result without amount");
                    continue;
                };

                let project_id = dimension(result.project_id.as_deref());
                let labels = CostLabels {
                    date: date.clone(),
                    project_name: self.resolver.resolve(&project_id).await,
                    project_id,
                    line_item: dimension(result.line_item.as_deref()),
                    organization_id: result
                        .organization_id
                        .unwrap_or_else(|| self.organization_id.clone()),
                    currency: dimension(amount.currency.as_deref()),
                };
                self.sink.set_cost(&labels, amount.value);
                line_items += 1;
            }
        }

        Ok(line_items)
    }
}

/// Flatten a joined resource task. A panicked or cancelled task is a failure
/// like any upstream error, so the cursor does not advance past it.
fn task_outcome(
    joined: Result<Result<ResourceReport, ClientError>, JoinError>,
) -> Result<ResourceReport, String> {
    match joined {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(e) => Err(format!("collection task failed: {e}")),
    }
}

/// Timing knobs for the two loops.
#[derive(Debug, Clone)]
pub struct Schedule {
    pub scrape_interval: Duration,
    pub query_offset: Duration,
    pub ledger_retention: Duration,
    pub cost_interval: Option<Duration>,
}

impl Schedule {
    pub fn from_config(config: &Config) -> Self {
        Self {
            scrape_interval: config.scrape_interval(),
            query_offset: config.query_offset(),
            ledger_retention: config.ledger_retention(),
            cost_interval: config
                .scrape
                .costs_enabled
                .then(|| config.cost_interval()),
        }
    }
}

/// Running collection loops. Dropping the handle does not stop them; call
/// [`Scheduler::shutdown`].
pub struct Scheduler {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawn the usage loop and, if enabled, the cost loop.
    pub fn start(exporter: Arc<Exporter>, schedule: Schedule, cancel: CancellationToken) -> Self {
        let mut tasks = vec![tokio::spawn(run_usage_loop(
            exporter.clone(),
            schedule.clone(),
            cancel.clone(),
        ))];

        if let Some(period) = schedule.cost_interval {
            tasks.push(tokio::spawn(run_cost_loop(exporter, period, cancel.clone())));
        }

        Self { cancel, tasks }
    }

    /// Signal the loops and wait for the current cycles to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Collection loop ended abnormally");
            }
        }
    }
}

async fn run_usage_loop(exporter: Arc<Exporter>, schedule: Schedule, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(schedule.scrape_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let query_offset = schedule.query_offset.as_secs() as i64;
    let retention = schedule.ledger_retention.as_secs() as i64;
    let mut cursor: Option<i64> = None;

    info!(
        interval_secs = schedule.scrape_interval.as_secs(),
        query_offset_secs = query_offset,
        "Starting usage collection loop"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let now = Utc::now().timestamp();
        let window = UsageWindow::next(cursor, now, query_offset, retention);
        let span = info_span!(
            "usage_cycle",
            cycle_id = %Uuid::new_v4(),
            window_start = window.start,
            window_end = window.end
        );

        let report = exporter.collect_usage(window, now).instrument(span).await;
        if report.all_succeeded() {
            cursor = Some(now);
            exporter.sink().set_last_scrape(now);
        }

        let pruned = exporter.ledger().prune(now - retention);
        if pruned > 0 {
            debug!(pruned, "Pruned expired ledger entries");
        }
        exporter.sink().set_ledger_entries(exporter.ledger().len());
    }

    info!("Usage collection loop stopped");
}

async fn run_cost_loop(exporter: Arc<Exporter>, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(interval_secs = period.as_secs(), "Starting cost collection loop");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match exporter.collect_costs(Utc::now()).await {
            Ok(line_items) => info!(line_items, "Collected daily costs"),
            Err(e) => {
                error!(error = %e, "Cost collection failed");
                exporter.sink().record_scrape_error("costs");
            }
        }
    }

    info!("Cost collection loop stopped");
}
