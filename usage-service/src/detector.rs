use std::collections::{HashMap, HashSet};

use hydrolink_client::{Granularity, UsageRecord};
use time::{Date, OffsetDateTime, UtcOffset};

/// Dedup identity of one record: interval start truncated to the
/// reporting granularity, in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PeriodKey {
    Day(Date),
    Hour(Date, u8),
}

impl PeriodKey {
    pub fn of(start: OffsetDateTime, granularity: Granularity) -> Self {
        let utc = start.to_offset(UtcOffset::UTC);
        match granularity {
            Granularity::Day => PeriodKey::Day(utc.date()),
            Granularity::Hour => PeriodKey::Hour(utc.date(), utc.hour()),
        }
    }
}

fn retention(granularity: Granularity) -> time::Duration {
    match granularity {
        Granularity::Day => time::Duration::days(60),
        Granularity::Hour => time::Duration::days(7),
    }
}

/// Age of a record in whole reporting units.
fn age_units(now: OffsetDateTime, start: OffsetDateTime, granularity: Granularity) -> i64 {
    let now = now.to_offset(UtcOffset::UTC);
    let start = start.to_offset(UtcOffset::UTC);
    match granularity {
        Granularity::Day => (now.date() - start.date()).whole_days(),
        Granularity::Hour => {
            now.unix_timestamp().div_euclid(3600) - start.unix_timestamp().div_euclid(3600)
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DetectorConfig {
    pub granularity: Granularity,
    /// Age in whole reporting units after which a record counts as final.
    pub settled_after: i64,
    /// Hold back zero-valued records that are exactly `settled_after` old;
    /// utilities often report a period as zero before finalizing it.
    pub zero_needs_extra_unit: bool,
}

impl DetectorConfig {
    pub fn daily() -> Self {
        Self {
            granularity: Granularity::Day,
            settled_after: 1,
            zero_needs_extra_unit: true,
        }
    }

    pub fn hourly() -> Self {
        Self {
            granularity: Granularity::Hour,
            settled_after: 1,
            zero_needs_extra_unit: true,
        }
    }
}

/// Whether a record is old enough to be treated as final.
pub fn is_settled(record: &UsageRecord, now: OffsetDateTime, cfg: &DetectorConfig) -> bool {
    let age = age_units(now, record.start, cfg.granularity);
    if age > cfg.settled_after {
        return true;
    }
    age == cfg.settled_after && (!cfg.zero_needs_extra_unit || record.total_gallons > 0.0)
}

/// Period keys already observed for one connection, bounded by the
/// retention window.
#[derive(Debug, Default)]
pub struct SeenWindow {
    seen: HashSet<PeriodKey>,
    last_update: Option<OffsetDateTime>,
}

impl SeenWindow {
    pub fn contains(&self, key: &PeriodKey) -> bool {
        self.seen.contains(key)
    }

    pub fn insert(&mut self, key: PeriodKey) {
        self.seen.insert(key);
    }

    pub fn touch(&mut self, now: OffsetDateTime) {
        self.last_update = Some(now);
    }

    pub fn purge(&mut self, now: OffsetDateTime, granularity: Granularity) {
        let cutoff = PeriodKey::of(now - retention(granularity), granularity);
        self.seen.retain(|k| *k > cutoff);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Classifies incoming usage records as new vs already seen and provisional
/// vs settled. Only settled periods ever enter the seen window, so a period
/// first observed while provisional is re-examined on every poll until it
/// finalizes.
pub struct HistoricalDataDetector {
    cfg: DetectorConfig,
    windows: tokio::sync::Mutex<HashMap<i64, SeenWindow>>,
}

impl HistoricalDataDetector {
    pub fn new(cfg: DetectorConfig) -> Self {
        Self {
            cfg,
            windows: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.cfg
    }

    /// Records that are both settled and unseen, ascending by start.
    pub async fn detect_new(
        &self,
        connection_id: i64,
        records: &[UsageRecord],
        now: OffsetDateTime,
    ) -> Vec<UsageRecord> {
        let windows = self.windows.lock().await;
        let window = windows.get(&connection_id);

        let mut fresh: Vec<UsageRecord> = records
            .iter()
            .filter(|r| is_settled(r, now, &self.cfg))
            .filter(|r| {
                let key = PeriodKey::of(r.start, self.cfg.granularity);
                window.map_or(true, |w| !w.contains(&key))
            })
            .cloned()
            .collect();

        fresh.sort_by(|a, b| a.start.cmp(&b.start));
        fresh
    }

    /// Fold a poll response into the connection's seen window. Provisional
    /// records are skipped so they stay detectable once settled.
    pub async fn mark_seen(
        &self,
        connection_id: i64,
        records: &[UsageRecord],
        now: OffsetDateTime,
    ) {
        let settled: Vec<PeriodKey> = records
            .iter()
            .filter(|r| is_settled(r, now, &self.cfg))
            .map(|r| PeriodKey::of(r.start, self.cfg.granularity))
            .collect();
        if settled.is_empty() {
            return;
        }

        let mut windows = self.windows.lock().await;
        let window = windows.entry(connection_id).or_default();
        for key in settled {
            window.insert(key);
        }
        window.touch(now);
        window.purge(now, self.cfg.granularity);
    }

    /// Maintenance purge across all connections.
    pub async fn purge_expired(&self, now: OffsetDateTime) {
        let mut windows = self.windows.lock().await;
        for window in windows.values_mut() {
            window.purge(now, self.cfg.granularity);
        }
    }

    pub async fn seen_count(&self, connection_id: i64) -> usize {
        let windows = self.windows.lock().await;
        windows.get(&connection_id).map_or(0, |w| w.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn record(start: OffsetDateTime, total_gallons: f64) -> UsageRecord {
        UsageRecord {
            start,
            end: start + time::Duration::days(1),
            total_gallons,
            irrigation_gallons: 0.0,
            irrigation_events: 0,
            is_leaking: false,
        }
    }

    const NOW: OffsetDateTime = datetime!(2025-06-15 12:00:00 UTC);

    #[test]
    fn one_day_old_zero_reading_is_not_settled() {
        let cfg = DetectorConfig::daily();
        let r = record(datetime!(2025-06-14 00:00:00 UTC), 0.0);
        assert!(!is_settled(&r, NOW, &cfg));
    }

    #[test]
    fn one_day_old_nonzero_reading_is_settled() {
        let cfg = DetectorConfig::daily();
        let r = record(datetime!(2025-06-14 00:00:00 UTC), 150.0);
        assert!(is_settled(&r, NOW, &cfg));
    }

    #[test]
    fn older_than_one_day_is_settled_regardless_of_value() {
        let cfg = DetectorConfig::daily();
        let r = record(datetime!(2025-06-13 00:00:00 UTC), 0.0);
        assert!(is_settled(&r, NOW, &cfg));
    }

    #[test]
    fn todays_reading_is_never_settled() {
        let cfg = DetectorConfig::daily();
        let r = record(datetime!(2025-06-15 00:00:00 UTC), 500.0);
        assert!(!is_settled(&r, NOW, &cfg));
    }

    #[test]
    fn zero_exception_can_be_disabled() {
        let cfg = DetectorConfig {
            zero_needs_extra_unit: false,
            ..DetectorConfig::daily()
        };
        let r = record(datetime!(2025-06-14 00:00:00 UTC), 0.0);
        assert!(is_settled(&r, NOW, &cfg));
    }

    #[test]
    fn hourly_age_uses_hour_buckets() {
        let cfg = DetectorConfig::hourly();
        // 10:30 seen from 12:00 is two hour-buckets back: settled.
        let settled = record(datetime!(2025-06-15 10:30:00 UTC), 0.0);
        assert!(is_settled(&settled, NOW, &cfg));
        // 11:30 is exactly one bucket back and zero: held back.
        let held = record(datetime!(2025-06-15 11:30:00 UTC), 0.0);
        assert!(!is_settled(&held, NOW, &cfg));
    }

    #[tokio::test]
    async fn detection_is_idempotent_after_mark_seen() {
        let detector = HistoricalDataDetector::new(DetectorConfig::daily());
        let records = vec![
            record(datetime!(2025-06-12 00:00:00 UTC), 100.0),
            record(datetime!(2025-06-13 00:00:00 UTC), 120.0),
        ];

        let first = detector.detect_new(1, &records, NOW).await;
        assert_eq!(first.len(), 2);
        detector.mark_seen(1, &records, NOW).await;

        let second = detector.detect_new(1, &records, NOW).await;
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn example_scenario_emits_only_settled_days() {
        // Days -3, -2, -1 (value 150), 0 (value 0) relative to 2025-06-15.
        let detector = HistoricalDataDetector::new(DetectorConfig::daily());
        let records = vec![
            record(datetime!(2025-06-12 00:00:00 UTC), 80.0),
            record(datetime!(2025-06-13 00:00:00 UTC), 90.0),
            record(datetime!(2025-06-14 00:00:00 UTC), 150.0),
            record(datetime!(2025-06-15 00:00:00 UTC), 0.0),
        ];

        let detected = detector.detect_new(7, &records, NOW).await;
        let starts: Vec<OffsetDateTime> = detected.iter().map(|r| r.start).collect();
        assert_eq!(
            starts,
            vec![
                datetime!(2025-06-12 00:00:00 UTC),
                datetime!(2025-06-13 00:00:00 UTC),
                datetime!(2025-06-14 00:00:00 UTC),
            ]
        );
    }

    #[tokio::test]
    async fn provisional_record_is_detected_once_it_settles() {
        let detector = HistoricalDataDetector::new(DetectorConfig::daily());
        let provisional = vec![record(datetime!(2025-06-14 00:00:00 UTC), 0.0)];

        assert!(detector.detect_new(1, &provisional, NOW).await.is_empty());
        detector.mark_seen(1, &provisional, NOW).await;
        assert_eq!(detector.seen_count(1).await, 0);

        // Next day the same period carries a final value.
        let later = datetime!(2025-06-16 12:00:00 UTC);
        let settled = vec![record(datetime!(2025-06-14 00:00:00 UTC), 42.0)];
        let detected = detector.detect_new(1, &settled, later).await;
        assert_eq!(detected.len(), 1);
        assert_eq!(detected[0].total_gallons, 42.0);
    }

    #[tokio::test]
    async fn seen_window_respects_retention_bound() {
        let detector = HistoricalDataDetector::new(DetectorConfig::daily());
        let records = vec![
            record(datetime!(2025-04-10 00:00:00 UTC), 10.0),
            record(datetime!(2025-04-16 00:00:00 UTC), 10.0),
            record(datetime!(2025-06-14 00:00:00 UTC), 10.0),
        ];

        detector.mark_seen(1, &records, NOW).await;
        // 2025-04-10 and 2025-04-16 are 66 and 60 days old: both beyond the
        // 60-day window, only the recent key survives.
        assert_eq!(detector.seen_count(1).await, 1);

        let purged = vec![record(datetime!(2025-04-16 00:00:00 UTC), 10.0)];
        let redetected = detector.detect_new(1, &purged, NOW).await;
        assert_eq!(redetected.len(), 1);
    }

    #[tokio::test]
    async fn purge_expired_trims_all_connections() {
        let detector = HistoricalDataDetector::new(DetectorConfig::daily());
        let old = vec![record(datetime!(2025-06-01 00:00:00 UTC), 5.0)];
        detector.mark_seen(1, &old, NOW).await;
        detector.mark_seen(2, &old, NOW).await;

        let far_future = datetime!(2025-09-15 00:00:00 UTC);
        detector.purge_expired(far_future).await;
        assert_eq!(detector.seen_count(1).await, 0);
        assert_eq!(detector.seen_count(2).await, 0);
    }
}
