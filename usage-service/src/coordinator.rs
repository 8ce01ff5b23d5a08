use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use hydrolink_client::{HydroLinkApi, ServiceConnection, UsageRecord};
use serde::Serialize;
use time::{OffsetDateTime, Time};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::connections::ConnectionCache;
use crate::detector::HistoricalDataDetector;
use crate::error::PollError;
use crate::merger::StatisticsMerger;

/// Usage fetches reach back this far so weekly sums always have history.
const BACKFILL_DAYS: i64 = 45;

/// Seen-window maintenance runs every this many successful cycles.
const CLEANUP_EVERY_CYCLES: u64 = 10;

/// Latest polled usage per connection. Replaced wholesale on every cycle;
/// readers hold an `Arc` to whichever snapshot was current when they asked.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageSnapshot {
    #[serde(with = "time::serde::rfc3339::option")]
    pub polled_at: Option<OffsetDateTime>,
    pub connections: HashMap<i64, Vec<UsageRecord>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PollHealth {
    pub cycles: u64,
    pub failed_cycles: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_success: Option<OffsetDateTime>,
    pub last_error: Option<String>,
    pub connections_tracked: usize,
}

#[derive(Debug)]
pub struct CycleOutcome {
    pub connections_polled: usize,
    pub connections_failed: usize,
}

#[derive(Clone)]
pub struct AppState {
    pub client: Arc<dyn HydroLinkApi>,
    pub connections: Arc<ConnectionCache>,
    pub detector: Arc<HistoricalDataDetector>,
    pub merger: Option<Arc<StatisticsMerger>>,
    snapshot: Arc<RwLock<Arc<UsageSnapshot>>>,
    health: Arc<RwLock<PollHealth>>,
}

impl AppState {
    pub fn new(
        client: Arc<dyn HydroLinkApi>,
        detector: HistoricalDataDetector,
        merger: Option<StatisticsMerger>,
    ) -> Self {
        Self {
            connections: Arc::new(ConnectionCache::new(Arc::clone(&client))),
            client,
            detector: Arc::new(detector),
            merger: merger.map(Arc::new),
            snapshot: Arc::new(RwLock::new(Arc::new(UsageSnapshot::default()))),
            health: Arc::new(RwLock::new(PollHealth::default())),
        }
    }

    pub async fn snapshot(&self) -> Arc<UsageSnapshot> {
        Arc::clone(&*self.snapshot.read().await)
    }

    pub async fn health(&self) -> PollHealth {
        self.health.read().await.clone()
    }

    async fn publish(&self, snapshot: UsageSnapshot) {
        let mut slot = self.snapshot.write().await;
        *slot = Arc::new(snapshot);
    }

    async fn record_cycle_success(&self, now: OffsetDateTime, tracked: usize) {
        let mut health = self.health.write().await;
        health.cycles += 1;
        health.last_success = Some(now);
        health.last_error = None;
        health.connections_tracked = tracked;
    }

    async fn record_cycle_failure(&self, error: &PollError) {
        let mut health = self.health.write().await;
        health.cycles += 1;
        health.failed_cycles += 1;
        health.last_error = Some(error.to_string());
    }
}

/// Fetch window: start of the current month or `BACKFILL_DAYS` ago,
/// whichever is earlier.
pub fn usage_window(now: OffsetDateTime) -> (OffsetDateTime, OffsetDateTime) {
    let month_start = now
        .replace_day(1)
        .expect("day 1 exists in every month")
        .replace_time(Time::MIDNIGHT);
    let backfill = now - time::Duration::days(BACKFILL_DAYS);
    (month_start.min(backfill), now)
}

/// One full poll cycle: list connections, fetch usage concurrently, run
/// detection and merging per connection, publish a fresh snapshot.
/// A failed connection is left out of the new snapshot; only a listing
/// failure fails the cycle and keeps the previous snapshot published.
pub async fn poll_usage_once(state: &AppState) -> Result<CycleOutcome, PollError> {
    metrics::counter!("poll_cycles_total").increment(1);

    let connections = match state.connections.get_connections().await {
        Ok(connections) => connections,
        Err(e) => {
            state.record_cycle_failure(&e).await;
            return Err(e);
        }
    };

    let now = OffsetDateTime::now_utc();
    let (start, end) = usage_window(now);

    let mut tasks = Vec::with_capacity(connections.len());
    for connection in &connections {
        tasks.push(tokio::spawn(poll_connection(
            state.clone(),
            connection.clone(),
            start,
            end,
        )));
    }
    let results = join_all(tasks).await;

    let mut polled: HashMap<i64, Vec<UsageRecord>> = HashMap::new();
    let mut failed = 0usize;
    for (connection, result) in connections.iter().zip(results) {
        let outcome = result.unwrap_or_else(|e| Err(PollError::Task(e.to_string())));
        match outcome {
            Ok(records) => {
                polled.insert(connection.id, records);
            }
            Err(e) => {
                failed += 1;
                metrics::counter!("poll_connection_failures_total").increment(1);
                tracing::warn!(
                    error = %e,
                    connection_id = connection.id,
                    connection = %connection.name,
                    "connection poll failed, leaving it out of this snapshot"
                );
            }
        }
    }

    let tracked = polled.len();
    state
        .publish(UsageSnapshot {
            polled_at: Some(now),
            connections: polled,
        })
        .await;
    state.record_cycle_success(now, tracked).await;

    Ok(CycleOutcome {
        connections_polled: connections.len(),
        connections_failed: failed,
    })
}

/// Fetch, detect and merge for a single connection. Seen windows only
/// advance after the merge landed, so a failed insert is retried on the
/// next cycle.
async fn poll_connection(
    state: AppState,
    connection: ServiceConnection,
    start: OffsetDateTime,
    end: OffsetDateTime,
) -> Result<Vec<UsageRecord>, PollError> {
    let client = Arc::clone(&state.client);
    let granularity = state.detector.config().granularity;
    let connection_id = connection.id;
    let response =
        tokio::task::spawn_blocking(move || client.get_usage(connection_id, start, end, granularity))
            .await
            .map_err(|e| PollError::Task(e.to_string()))??;

    let records = response.usage_data;
    metrics::counter!("poll_usage_records_total").increment(records.len() as u64);

    let now = OffsetDateTime::now_utc();
    let settled = state.detector.detect_new(connection.id, &records, now).await;
    metrics::counter!("usage_records_detected_total").increment(settled.len() as u64);
    if !settled.is_empty() {
        match &state.merger {
            Some(merger) => {
                let inserted = merger.merge(connection.id, &settled, &connection).await?;
                if inserted > 0 {
                    tracing::info!(
                        connection_id = connection.id,
                        points = inserted,
                        "inserted historical statistics"
                    );
                }
            }
            None => {
                tracing::warn!(
                    connection_id = connection.id,
                    records = settled.len(),
                    "no statistics store configured, skipping insertion"
                );
                metrics::counter!("statistics_merge_skipped_total")
                    .increment(settled.len() as u64);
            }
        }
        state.detector.mark_seen(connection.id, &settled, now).await;
    }

    Ok(records)
}

pub struct UsagePoller {
    state: AppState,
    interval: Duration,
}

impl UsagePoller {
    pub fn new(state: AppState, interval: Duration) -> Self {
        Self { state, interval }
    }

    pub fn start(self, cancel: CancellationToken) {
        let state = self.state;
        let interval = self.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut successes: u64 = 0;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match poll_usage_once(&state).await {
                            Ok(outcome) => {
                                successes += 1;
                                if successes % CLEANUP_EVERY_CYCLES == 0 {
                                    state.detector.purge_expired(OffsetDateTime::now_utc()).await;
                                }
                                tracing::info!(
                                    connections = outcome.connections_polled,
                                    failed = outcome.connections_failed,
                                    "usage poll cycle complete"
                                );
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "usage poll cycle failed");
                            }
                        }
                    }
                }
            }
        });
    }
}

pub struct ConnectionPoller {
    state: AppState,
    interval: Duration,
}

impl ConnectionPoller {
    pub fn new(state: AppState, interval: Duration) -> Self {
        Self { state, interval }
    }

    pub fn start(self, cancel: CancellationToken) {
        let state = self.state;
        let interval = self.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match state.connections.refresh().await {
                            Ok(count) => {
                                tracing::debug!(connections = count, "service connection listing refreshed");
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "service connection refresh failed");
                            }
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::DetectorConfig;
    use crate::statistics::{
        MemoryStatisticsStore, StatisticCheckpoint, StatisticMetadata, StatisticPoint,
        StatisticsError, StatisticsStore,
    };
    use hydrolink_client::{ClientError, Granularity, UsageResponse};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use time::macros::datetime;

    struct MockApi {
        usage: Mutex<HashMap<i64, Vec<UsageRecord>>>,
        connections: Vec<ServiceConnection>,
        fail_usage_for: Mutex<HashSet<i64>>,
        fail_listing: AtomicBool,
    }

    impl MockApi {
        fn new(connection_ids: &[i64]) -> Self {
            Self {
                usage: Mutex::new(HashMap::new()),
                connections: connection_ids.iter().map(|&id| connection(id)).collect(),
                fail_usage_for: Mutex::new(HashSet::new()),
                fail_listing: AtomicBool::new(false),
            }
        }

        fn set_usage(&self, connection_id: i64, records: Vec<UsageRecord>) {
            self.usage.lock().unwrap().insert(connection_id, records);
        }

        fn fail_usage(&self, connection_id: i64) {
            self.fail_usage_for.lock().unwrap().insert(connection_id);
        }
    }

    impl HydroLinkApi for MockApi {
        fn login(&self, _username: &str, _password: &str) -> Result<bool, ClientError> {
            Ok(true)
        }

        fn is_logged_in(&self) -> bool {
            true
        }

        fn logout(&self) -> Result<(), ClientError> {
            Ok(())
        }

        fn list_service_connections(&self) -> Result<Vec<ServiceConnection>, ClientError> {
            if self.fail_listing.load(Ordering::SeqCst) {
                return Err(ClientError::Malformed("listing unavailable".to_string()));
            }
            Ok(self.connections.clone())
        }

        fn get_service_connection(&self, id: i64) -> Result<Option<ServiceConnection>, ClientError> {
            Ok(self.connections.iter().find(|c| c.id == id).cloned())
        }

        fn get_usage(
            &self,
            connection_id: i64,
            _start: OffsetDateTime,
            _end: OffsetDateTime,
            _granularity: Granularity,
        ) -> Result<UsageResponse, ClientError> {
            if self.fail_usage_for.lock().unwrap().contains(&connection_id) {
                return Err(ClientError::Malformed("usage unavailable".to_string()));
            }
            let usage_data = self
                .usage
                .lock()
                .unwrap()
                .get(&connection_id)
                .cloned()
                .unwrap_or_default();
            Ok(UsageResponse {
                total_items: usage_data.len(),
                usage_data,
            })
        }
    }

    fn connection(id: i64) -> ServiceConnection {
        ServiceConnection {
            id,
            name: format!("Connection {id}"),
            address: "Address".to_string(),
            account_number: "ACC".to_string(),
            service_type: "residential".to_string(),
            status: "active".to_string(),
            meter_serial: "MTR".to_string(),
        }
    }

    fn days_back(back: i64, total: f64) -> UsageRecord {
        let start = OffsetDateTime::now_utc().replace_time(Time::MIDNIGHT)
            - time::Duration::days(back);
        UsageRecord {
            start,
            end: start + time::Duration::days(1),
            total_gallons: total,
            irrigation_gallons: 0.0,
            irrigation_events: 0,
            is_leaking: false,
        }
    }

    fn state_with(api: Arc<MockApi>, store: Option<Arc<MemoryStatisticsStore>>) -> AppState {
        let merger = store
            .map(|s| StatisticsMerger::new(s as Arc<dyn StatisticsStore>));
        AppState::new(
            api as Arc<dyn HydroLinkApi>,
            HistoricalDataDetector::new(DetectorConfig::daily()),
            merger,
        )
    }

    #[tokio::test]
    async fn cycle_publishes_a_snapshot_and_inserts_statistics() {
        let api = Arc::new(MockApi::new(&[1, 2]));
        api.set_usage(1, vec![days_back(2, 100.0), days_back(1, 150.0)]);
        api.set_usage(2, vec![days_back(2, 30.0)]);
        let store = Arc::new(MemoryStatisticsStore::new());
        let state = state_with(Arc::clone(&api), Some(Arc::clone(&store)));

        let outcome = poll_usage_once(&state).await.unwrap();
        assert_eq!(outcome.connections_polled, 2);
        assert_eq!(outcome.connections_failed, 0);

        let snapshot = state.snapshot().await;
        assert!(snapshot.polled_at.is_some());
        assert_eq!(snapshot.connections.len(), 2);
        assert_eq!(snapshot.connections[&1].len(), 2);

        let series = store.points("hydrolink:1_total_gallons").await;
        assert_eq!(series.len(), 2);
        assert_eq!(series[1].sum, 250.0);

        let health = state.health().await;
        assert_eq!(health.cycles, 1);
        assert_eq!(health.failed_cycles, 0);
        assert!(health.last_success.is_some());
        assert_eq!(health.connections_tracked, 2);
    }

    #[tokio::test]
    async fn second_cycle_with_same_data_inserts_nothing() {
        let api = Arc::new(MockApi::new(&[1]));
        api.set_usage(1, vec![days_back(2, 100.0), days_back(1, 150.0)]);
        let store = Arc::new(MemoryStatisticsStore::new());
        let state = state_with(Arc::clone(&api), Some(Arc::clone(&store)));

        poll_usage_once(&state).await.unwrap();
        let after_first = store.points("hydrolink:1_total_gallons").await.len();
        poll_usage_once(&state).await.unwrap();
        let after_second = store.points("hydrolink:1_total_gallons").await.len();

        assert_eq!(after_first, 2);
        assert_eq!(after_second, 2);
        assert_eq!(state.detector.seen_count(1).await, 2);
    }

    #[tokio::test]
    async fn failed_connection_is_absent_from_the_new_snapshot() {
        let api = Arc::new(MockApi::new(&[1, 2]));
        api.set_usage(1, vec![days_back(2, 100.0)]);
        api.set_usage(2, vec![days_back(2, 30.0)]);
        let state = state_with(Arc::clone(&api), None);

        poll_usage_once(&state).await.unwrap();
        assert!(state.snapshot().await.connections.contains_key(&2));

        api.set_usage(1, vec![days_back(2, 100.0), days_back(1, 150.0)]);
        api.fail_usage(2);
        let outcome = poll_usage_once(&state).await.unwrap();
        assert_eq!(outcome.connections_failed, 1);

        let snapshot = state.snapshot().await;
        assert_eq!(snapshot.connections[&1].len(), 2);
        assert!(!snapshot.connections.contains_key(&2));
        assert_eq!(state.health().await.connections_tracked, 1);
    }

    #[tokio::test]
    async fn published_snapshots_are_immutable_to_readers() {
        let api = Arc::new(MockApi::new(&[1]));
        api.set_usage(1, vec![days_back(2, 100.0)]);
        let state = state_with(Arc::clone(&api), None);

        poll_usage_once(&state).await.unwrap();
        let held = state.snapshot().await;
        let first_polled_at = held.polled_at;

        api.set_usage(1, vec![days_back(2, 100.0), days_back(1, 150.0)]);
        poll_usage_once(&state).await.unwrap();

        assert_eq!(held.polled_at, first_polled_at);
        assert_eq!(held.connections[&1].len(), 1);
        assert_eq!(state.snapshot().await.connections[&1].len(), 2);
    }

    #[tokio::test]
    async fn listing_failure_fails_the_cycle() {
        let api = Arc::new(MockApi::new(&[1]));
        api.fail_listing.store(true, Ordering::SeqCst);
        let state = state_with(Arc::clone(&api), None);

        let err = poll_usage_once(&state).await.unwrap_err();
        assert!(matches!(err, PollError::Api(_)));

        let health = state.health().await;
        assert_eq!(health.cycles, 1);
        assert_eq!(health.failed_cycles, 1);
        assert!(health.last_error.is_some());
        assert!(state.snapshot().await.polled_at.is_none());
    }

    #[tokio::test]
    async fn missing_store_skips_insertion_but_still_publishes() {
        let api = Arc::new(MockApi::new(&[1]));
        api.set_usage(1, vec![days_back(2, 100.0)]);
        let state = state_with(Arc::clone(&api), None);

        let outcome = poll_usage_once(&state).await.unwrap();
        assert_eq!(outcome.connections_failed, 0);
        assert_eq!(state.snapshot().await.connections.len(), 1);
        // Skipped records still count as seen so the warning fires once.
        assert_eq!(state.detector.seen_count(1).await, 1);
    }

    #[tokio::test]
    async fn merge_failure_leaves_records_unseen_for_retry() {
        struct FailingStore;

        #[async_trait::async_trait]
        impl StatisticsStore for FailingStore {
            async fn last_statistic(
                &self,
                _statistic_id: &str,
            ) -> Result<Option<StatisticCheckpoint>, StatisticsError> {
                Ok(None)
            }

            async fn add_statistics(
                &self,
                _metadata: &StatisticMetadata,
                _points: &[StatisticPoint],
            ) -> Result<(), StatisticsError> {
                Err(StatisticsError::Unavailable("down".to_string()))
            }
        }

        let api = Arc::new(MockApi::new(&[1]));
        api.set_usage(1, vec![days_back(2, 100.0)]);
        let state = AppState::new(
            Arc::clone(&api) as Arc<dyn HydroLinkApi>,
            HistoricalDataDetector::new(DetectorConfig::daily()),
            Some(StatisticsMerger::new(Arc::new(FailingStore))),
        );

        let outcome = poll_usage_once(&state).await.unwrap();
        assert_eq!(outcome.connections_failed, 1);
        assert_eq!(state.detector.seen_count(1).await, 0);
        assert!(state.snapshot().await.connections.is_empty());
    }

    #[test]
    fn usage_window_reaches_the_earlier_of_month_start_and_backfill() {
        let (start, end) = usage_window(datetime!(2025-06-20 12:00:00 UTC));
        assert_eq!(start, datetime!(2025-05-06 12:00:00 UTC));
        assert_eq!(end, datetime!(2025-06-20 12:00:00 UTC));

        // Early in a long month the month start still loses to the backfill.
        let (start, _) = usage_window(datetime!(2025-03-02 00:00:00 UTC));
        assert_eq!(start, datetime!(2025-01-16 00:00:00 UTC));
    }
}
