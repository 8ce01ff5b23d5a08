use std::collections::HashMap;

use tokio::sync::Mutex;

use super::{StatisticCheckpoint, StatisticMetadata, StatisticPoint, StatisticsError, StatisticsStore};

/// In-memory store with the same upsert semantics as the Postgres one.
/// Backs the merger and coordinator tests.
#[derive(Default)]
pub struct MemoryStatisticsStore {
    series: Mutex<HashMap<String, Vec<StatisticPoint>>>,
}

impl MemoryStatisticsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded points for a series, ascending by start.
    pub async fn points(&self, statistic_id: &str) -> Vec<StatisticPoint> {
        let series = self.series.lock().await;
        series.get(statistic_id).cloned().unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl StatisticsStore for MemoryStatisticsStore {
    async fn last_statistic(
        &self,
        statistic_id: &str,
    ) -> Result<Option<StatisticCheckpoint>, StatisticsError> {
        let series = self.series.lock().await;
        Ok(series.get(statistic_id).and_then(|points| {
            points.last().map(|p| StatisticCheckpoint {
                sum: p.sum,
                start: p.start,
            })
        }))
    }

    async fn add_statistics(
        &self,
        metadata: &StatisticMetadata,
        points: &[StatisticPoint],
    ) -> Result<(), StatisticsError> {
        let mut series = self.series.lock().await;
        let entry = series.entry(metadata.statistic_id.clone()).or_default();
        for point in points {
            match entry.iter_mut().find(|p| p.start == point.start) {
                Some(existing) => *existing = point.clone(),
                None => entry.push(point.clone()),
            }
        }
        entry.sort_by(|a, b| a.start.cmp(&b.start));
        Ok(())
    }
}
