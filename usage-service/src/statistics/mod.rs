pub mod memory;
pub mod postgres;

pub use memory::MemoryStatisticsStore;
pub use postgres::PgStatisticsStore;

use time::OffsetDateTime;

/// Resume state for one cumulative series: the last durably recorded point.
#[derive(Debug, Clone, PartialEq)]
pub struct StatisticCheckpoint {
    pub sum: f64,
    pub start: OffsetDateTime,
}

/// One point of a cumulative series.
#[derive(Debug, Clone, PartialEq)]
pub struct StatisticPoint {
    pub start: OffsetDateTime,
    pub state: f64,
    pub sum: f64,
}

/// Descriptive metadata for a series, written alongside its points.
#[derive(Debug, Clone)]
pub struct StatisticMetadata {
    pub statistic_id: String,
    pub name: String,
    pub unit: Option<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum StatisticsError {
    #[error("statistics backend unavailable: {0}")]
    Unavailable(String),
    #[error("statistics query failed: {0}")]
    Query(String),
    #[error("statistics write failed: {0}")]
    Write(String),
}

/// Narrow interface to the durable statistics backend. The checkpoint read
/// through `last_statistic` is the only guard against duplicate insertion
/// across process restarts, so it must be re-read on every merge batch.
#[async_trait::async_trait]
pub trait StatisticsStore: Send + Sync {
    /// Latest recorded point for a series, if any.
    async fn last_statistic(
        &self,
        statistic_id: &str,
    ) -> Result<Option<StatisticCheckpoint>, StatisticsError>;

    /// Append a batch of points for one series. The batch lands atomically;
    /// re-sending an already recorded start upserts that row.
    async fn add_statistics(
        &self,
        metadata: &StatisticMetadata,
        points: &[StatisticPoint],
    ) -> Result<(), StatisticsError>;
}
