use std::collections::HashSet;
use std::sync::Arc;

use hydrolink_client::{ServiceConnection, UsageRecord};
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::statistics::{StatisticMetadata, StatisticPoint, StatisticsError, StatisticsStore};

/// $8.47 per 748 gallons, the volumetric rate printed on residential bills.
pub const COST_PER_GALLON: f64 = 8.47 / 748.0;

/// A checkpoint newer than the oldest incoming record by more than this is
/// treated as corrupted rather than trusted to skip everything.
const CHECKPOINT_TOLERANCE: time::Duration = time::Duration::days(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    TotalGallons,
    IrrigationGallons,
    IrrigationEvents,
    TotalCost,
}

const METRICS: [Metric; 4] = [
    Metric::TotalGallons,
    Metric::IrrigationGallons,
    Metric::IrrigationEvents,
    Metric::TotalCost,
];

impl Metric {
    pub fn key(&self) -> &'static str {
        match self {
            Metric::TotalGallons => "total_gallons",
            Metric::IrrigationGallons => "irrigation_gallons",
            Metric::IrrigationEvents => "irrigation_events",
            Metric::TotalCost => "total_cost",
        }
    }

    fn unit(&self) -> Option<&'static str> {
        match self {
            Metric::TotalGallons | Metric::IrrigationGallons => Some("gal"),
            Metric::IrrigationEvents => None,
            Metric::TotalCost => Some("$"),
        }
    }

    fn display_name(&self, connection_name: &str) -> String {
        match self {
            Metric::TotalGallons => format!("HydroLink {connection_name} Total Water Usage"),
            Metric::IrrigationGallons => {
                format!("HydroLink {connection_name} Irrigation Water Usage")
            }
            Metric::IrrigationEvents => format!("HydroLink {connection_name} Irrigation Events"),
            Metric::TotalCost => format!("HydroLink {connection_name} Total Water Cost"),
        }
    }

    /// Per-record value of this series. Cost is derived at merge time and
    /// rounded to cents per point; sums accumulate the rounded values.
    fn value(&self, record: &UsageRecord) -> f64 {
        match self {
            Metric::TotalGallons => record.total_gallons,
            Metric::IrrigationGallons => record.irrigation_gallons,
            Metric::IrrigationEvents => f64::from(record.irrigation_events),
            Metric::TotalCost => round_cents(record.total_gallons * COST_PER_GALLON),
        }
    }
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn statistic_id(connection_id: i64, metric: Metric) -> String {
    format!("hydrolink:{connection_id}_{}", metric.key())
}

fn hash_str(hasher: &mut blake3::Hasher, s: &str) {
    let len = s.len() as u32;
    hasher.update(&len.to_le_bytes());
    hasher.update(s.as_bytes());
}

/// Session-scoped idempotency key for one merge batch: series id plus the
/// batch's timestamp span.
fn batch_key(statistic_id: &str, batch: &[UsageRecord]) -> String {
    let mut h = blake3::Hasher::new();
    hash_str(&mut h, statistic_id);
    if let Some(min) = batch.iter().map(|r| r.start).min() {
        h.update(&min.unix_timestamp_nanos().to_le_bytes());
    }
    if let Some(max) = batch.iter().map(|r| r.start).max() {
        h.update(&max.unix_timestamp_nanos().to_le_bytes());
    }
    h.finalize().to_hex().to_string()
}

#[derive(thiserror::Error, Debug)]
pub enum MergeError {
    #[error(
        "{failed} of {attempted} statistic series failed for connection {connection_id} \
         ({inserted} points inserted)"
    )]
    Partial {
        connection_id: i64,
        failed: usize,
        attempted: usize,
        inserted: usize,
    },
}

/// Converts settled records into cumulative series, resuming each series
/// from its persisted checkpoint.
pub struct StatisticsMerger {
    store: Arc<dyn StatisticsStore>,
    merged_batches: Mutex<HashSet<String>>,
}

impl StatisticsMerger {
    pub fn new(store: Arc<dyn StatisticsStore>) -> Self {
        Self {
            store,
            merged_batches: Mutex::new(HashSet::new()),
        }
    }

    /// Merge one connection's settled records into all tracked series.
    /// A failing series does not abort its siblings; any failure is
    /// surfaced after every series has been attempted.
    pub async fn merge(
        &self,
        connection_id: i64,
        settled: &[UsageRecord],
        connection: &ServiceConnection,
    ) -> Result<usize, MergeError> {
        if settled.is_empty() {
            return Ok(0);
        }

        let mut batch: Vec<UsageRecord> = settled.to_vec();
        batch.sort_by(|a, b| a.start.cmp(&b.start));

        let mut inserted = 0usize;
        let mut failed = 0usize;
        for metric in METRICS {
            match self
                .merge_metric(connection_id, metric, &batch, connection)
                .await
            {
                Ok(count) => inserted += count,
                Err(e) => {
                    failed += 1;
                    tracing::error!(
                        error = %e,
                        metric = metric.key(),
                        connection_id,
                        "statistic series merge failed"
                    );
                    metrics::counter!("statistics_merge_errors_total").increment(1);
                }
            }
        }

        if failed > 0 {
            return Err(MergeError::Partial {
                connection_id,
                failed,
                attempted: METRICS.len(),
                inserted,
            });
        }
        Ok(inserted)
    }

    async fn merge_metric(
        &self,
        connection_id: i64,
        metric: Metric,
        batch: &[UsageRecord],
        connection: &ServiceConnection,
    ) -> Result<usize, StatisticsError> {
        let id = statistic_id(connection_id, metric);
        let key = batch_key(&id, batch);

        if self.merged_batches.lock().await.contains(&key) {
            tracing::debug!(statistic_id = %id, "batch already merged this session, skipping");
            return Ok(0);
        }

        let mut sum = 0.0;
        let mut last_start: Option<OffsetDateTime> = None;

        if let Some(checkpoint) = self.store.last_statistic(&id).await? {
            let oldest = match batch.first() {
                Some(r) => r.start,
                None => return Ok(0),
            };
            if checkpoint.start > oldest + CHECKPOINT_TOLERANCE {
                tracing::warn!(
                    statistic_id = %id,
                    checkpoint_start = %checkpoint.start,
                    oldest_incoming = %oldest,
                    "checkpoint is newer than incoming data, resetting cumulative sum"
                );
                metrics::counter!("statistics_checkpoint_resets_total").increment(1);
            } else {
                sum = checkpoint.sum;
                last_start = Some(checkpoint.start);
            }
        }

        let mut points = Vec::new();
        for record in batch {
            if let Some(last) = last_start {
                if record.start <= last {
                    continue;
                }
            }
            let value = metric.value(record);
            sum += value;
            points.push(StatisticPoint {
                start: record.start,
                state: value,
                sum,
            });
        }

        if !points.is_empty() {
            let metadata = StatisticMetadata {
                statistic_id: id,
                name: metric.display_name(&connection.name),
                unit: metric.unit().map(str::to_string),
            };
            self.store.add_statistics(&metadata, &points).await?;
        }

        // Recorded only after the store accepted the batch, so a failed
        // batch is retried on the next cycle.
        self.merged_batches.lock().await.insert(key);
        Ok(points.len())
    }
}
