use hydrolink_client::{ServiceConnection, UsageRecord};
use serde::Serialize;
use time::{Date, OffsetDateTime};

/// Sum of `field` over the last `n` records. Shorter histories sum what
/// exists.
pub fn rolling_sum(records: &[UsageRecord], n: usize, field: impl Fn(&UsageRecord) -> f64) -> f64 {
    rolling_window(records, n).iter().map(field).sum()
}

fn rolling_window(records: &[UsageRecord], n: usize) -> &[UsageRecord] {
    &records[records.len().saturating_sub(n)..]
}

/// Total gallons since the first day of `today`'s calendar month.
pub fn month_to_date(records: &[UsageRecord], today: Date) -> f64 {
    month_window(records, today)
        .iter()
        .map(|r| r.total_gallons)
        .sum()
}

/// Suffix of `records` falling in `today`'s calendar month. Relies on the
/// records being ascending by start.
fn month_window(records: &[UsageRecord], today: Date) -> &[UsageRecord] {
    let month_start = today.replace_day(1).expect("day 1 exists in every month");
    let from = records.partition_point(|r| r.start.date() < month_start);
    &records[from..]
}

fn window_span(window: &[UsageRecord]) -> Option<(OffsetDateTime, OffsetDateTime)> {
    window
        .first()
        .zip(window.last())
        .map(|(first, last)| (first.start, last.end))
}

/// Latest record whose `field` can be trusted not to be revised: today's
/// record is always excluded, yesterday's only while its value is still
/// exactly zero.
pub fn complete_latest<'a>(
    records: &'a [UsageRecord],
    today: Date,
    field: impl Fn(&UsageRecord) -> f64,
) -> Option<&'a UsageRecord> {
    let yesterday = today.previous_day();
    records
        .iter()
        .filter(|r| {
            let date = r.start.date();
            if date >= today {
                return false;
            }
            !(Some(date) == yesterday && field(r) == 0.0)
        })
        .last()
}

pub fn leak_detected(records: &[UsageRecord]) -> Option<bool> {
    records.last().map(|r| r.is_leaking)
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum EntityValue {
    Number(f64),
    Bool(bool),
    None,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityAttributes {
    pub connection_id: i64,
    pub connection_name: String,
    pub address: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub period_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub period_end: Option<OffsetDateTime>,
    pub is_leaking: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityState {
    pub unique_id: String,
    pub name: String,
    pub state: EntityValue,
    pub attributes: EntityAttributes,
}

pub fn unique_id(connection_id: i64, key: &str) -> String {
    format!("hydrolink_{connection_id}_{key}")
}

/// All derived entities for one connection, computed from its snapshot
/// records. `today` is injected so month and completeness boundaries are
/// testable.
pub fn connection_entities(
    connection: &ServiceConnection,
    records: &[UsageRecord],
    today: Date,
) -> Vec<EntityState> {
    let leaking = leak_detected(records).unwrap_or(false);
    let latest_span = records.last().map(|r| (r.start, r.end));

    let attrs = |span: Option<(OffsetDateTime, OffsetDateTime)>| EntityAttributes {
        connection_id: connection.id,
        connection_name: connection.name.clone(),
        address: connection.address.clone(),
        period_start: span.map(|(s, _)| s),
        period_end: span.map(|(_, e)| e),
        is_leaking: leaking,
    };
    let entity = |key: &str, name: &str, state, span| EntityState {
        unique_id: unique_id(connection.id, key),
        name: format!("HydroLink {} {name}", connection.name),
        state,
        attributes: attrs(span),
    };
    let sum_entity = |key, name, n| {
        let window = rolling_window(records, n);
        let state = if window.is_empty() {
            EntityValue::None
        } else {
            EntityValue::Number(rolling_sum(records, n, |r| r.total_gallons))
        };
        entity(key, name, state, window_span(window))
    };

    let monthly_state = if records.is_empty() {
        EntityValue::None
    } else {
        EntityValue::Number(month_to_date(records, today))
    };
    let monthly_span = window_span(month_window(records, today));

    let irrigation = complete_latest(records, today, |r| r.irrigation_gallons);
    let events = complete_latest(records, today, |r| f64::from(r.irrigation_events));
    let latest_value = |record: Option<&UsageRecord>, field: fn(&UsageRecord) -> f64| {
        record.map_or(EntityValue::None, |r| EntityValue::Number(field(r)))
    };

    vec![
        sum_entity("daily_total", "Daily Usage", 1),
        sum_entity("weekly_total", "Weekly Usage", 7),
        entity("monthly_total", "Monthly Usage", monthly_state, monthly_span),
        entity(
            "irrigation_gallons",
            "Irrigation Usage",
            latest_value(irrigation, |r| r.irrigation_gallons),
            irrigation.map(|r| (r.start, r.end)),
        ),
        entity(
            "irrigation_events",
            "Irrigation Events",
            latest_value(events, |r| f64::from(r.irrigation_events)),
            events.map(|r| (r.start, r.end)),
        ),
        entity(
            "leak_detected",
            "Leak Detected",
            leak_detected(records).map_or(EntityValue::None, EntityValue::Bool),
            latest_span,
        ),
        entity(
            "connection_status",
            "Connection Status",
            EntityValue::Bool(!records.is_empty()),
            latest_span,
        ),
    ]
}
