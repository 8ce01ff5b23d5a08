use std::time::Duration;

use sqlx::{postgres::PgPool, Postgres, QueryBuilder};

use super::{StatisticCheckpoint, StatisticMetadata, StatisticPoint, StatisticsError, StatisticsStore};

#[derive(Debug, sqlx::FromRow)]
struct CheckpointRow {
    sum: f64,
    start: time::OffsetDateTime,
}

pub struct PgStatisticsStore {
    pool: PgPool,
    max_retries: u32,
    retry_backoff: Duration,
}

impl PgStatisticsStore {
    pub fn new(pool: PgPool, max_retries: u32, retry_backoff: Duration) -> Self {
        Self {
            pool,
            max_retries,
            retry_backoff,
        }
    }

    /// Create the backing tables when they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), StatisticsError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS statistic_meta (
                statistic_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                unit TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StatisticsError::Unavailable(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS statistic_points (
                statistic_id TEXT NOT NULL,
                start TIMESTAMPTZ NOT NULL,
                state DOUBLE PRECISION NOT NULL,
                sum DOUBLE PRECISION NOT NULL,
                PRIMARY KEY (statistic_id, start)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StatisticsError::Unavailable(e.to_string()))?;

        Ok(())
    }

    async fn insert_batch(
        &self,
        metadata: &StatisticMetadata,
        points: &[StatisticPoint],
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO statistic_meta (statistic_id, name, unit)
            VALUES ($1, $2, $3)
            ON CONFLICT (statistic_id)
            DO UPDATE SET name = EXCLUDED.name, unit = EXCLUDED.unit
            "#,
        )
        .bind(&metadata.statistic_id)
        .bind(&metadata.name)
        .bind(&metadata.unit)
        .execute(&mut *tx)
        .await?;

        let mut builder = QueryBuilder::<Postgres>::new(
            "INSERT INTO statistic_points (statistic_id, start, state, sum) ",
        );
        builder.push_values(points, |mut b, point| {
            b.push_bind(&metadata.statistic_id)
                .push_bind(point.start)
                .push_bind(point.state)
                .push_bind(point.sum);
        });
        builder.push(
            " ON CONFLICT (statistic_id, start) DO UPDATE SET state = EXCLUDED.state, sum = EXCLUDED.sum",
        );

        builder.build().execute(&mut *tx).await?;

        tx.commit().await
    }
}

#[async_trait::async_trait]
impl StatisticsStore for PgStatisticsStore {
    async fn last_statistic(
        &self,
        statistic_id: &str,
    ) -> Result<Option<StatisticCheckpoint>, StatisticsError> {
        let row = sqlx::query_as::<_, CheckpointRow>(
            r#"
            SELECT sum, start
            FROM statistic_points
            WHERE statistic_id = $1
            ORDER BY start DESC
            LIMIT 1
            "#,
        )
        .bind(statistic_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StatisticsError::Query(e.to_string()))?;

        Ok(row.map(|r| StatisticCheckpoint {
            sum: r.sum,
            start: r.start,
        }))
    }

    async fn add_statistics(
        &self,
        metadata: &StatisticMetadata,
        points: &[StatisticPoint],
    ) -> Result<(), StatisticsError> {
        if points.is_empty() {
            return Ok(());
        }

        let mut attempt: u32 = 0;
        loop {
            match self.insert_batch(metadata, points).await {
                Ok(()) => {
                    metrics::counter!("statistics_points_inserted_total")
                        .increment(points.len() as u64);
                    return Ok(());
                }
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    let sleep_for = self.retry_backoff * attempt;
                    tracing::warn!(
                        error = %e,
                        attempt,
                        statistic_id = %metadata.statistic_id,
                        "statistics batch write failed, retrying with backoff"
                    );
                    metrics::counter!("statistics_store_retry_total").increment(1);
                    tokio::time::sleep(sleep_for).await;
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        statistic_id = %metadata.statistic_id,
                        "statistics batch write failed, giving up"
                    );
                    metrics::counter!("statistics_store_errors_total").increment(1);
                    return Err(StatisticsError::Write(e.to_string()));
                }
            }
        }
    }
}
