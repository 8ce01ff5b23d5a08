use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Reporting unit of a usage record: one calendar day or one clock hour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Day,
    Hour,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Day => "day",
            Granularity::Hour => "hour",
        }
    }
}

/// One metered point of delivery on the account. Changes rarely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConnection {
    pub id: i64,
    pub name: String,
    pub address: String,
    pub account_number: String,
    pub service_type: String,
    pub status: String,
    pub meter_serial: String,
}

/// One metered interval's readings. Immutable once returned by the portal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
    pub total_gallons: f64,
    pub irrigation_gallons: f64,
    pub irrigation_events: u32,
    pub is_leaking: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageResponse {
    pub usage_data: Vec<UsageRecord>,
    pub total_items: usize,
}

#[derive(Debug, thiserror::Error)]
#[error("malformed interval {0:?}")]
pub struct MalformedInterval(pub String);

/// Wire shape of one usage row. The portal reports the interval as a single
/// `during` string, `"<start>/<end>"` with RFC 3339 halves, and event counts
/// as JSON floats.
#[derive(Debug, Deserialize)]
pub struct RawUsage {
    pub during: String,
    pub total_gallons: f64,
    pub irrigation_gallons: f64,
    pub irrigation_events: f64,
    pub is_leaking: bool,
}

#[derive(Debug, Deserialize)]
pub struct RawUsageResponse {
    pub usage_data: Vec<RawUsage>,
    pub total_items: usize,
}

/// Split a `during` interval into its start and end timestamps.
pub fn parse_during(during: &str) -> Result<(OffsetDateTime, OffsetDateTime), MalformedInterval> {
    let (start_raw, end_raw) = during
        .split_once('/')
        .ok_or_else(|| MalformedInterval(during.to_string()))?;

    let start = OffsetDateTime::parse(start_raw, &Rfc3339)
        .map_err(|_| MalformedInterval(during.to_string()))?;
    let end = OffsetDateTime::parse(end_raw, &Rfc3339)
        .map_err(|_| MalformedInterval(during.to_string()))?;

    Ok((start, end))
}

impl TryFrom<RawUsage> for UsageRecord {
    type Error = MalformedInterval;

    fn try_from(raw: RawUsage) -> Result<Self, Self::Error> {
        let (start, end) = parse_during(&raw.during)?;
        Ok(UsageRecord {
            start,
            end,
            total_gallons: raw.total_gallons,
            irrigation_gallons: raw.irrigation_gallons,
            irrigation_events: raw.irrigation_events.round().max(0.0) as u32,
            is_leaking: raw.is_leaking,
        })
    }
}

impl TryFrom<RawUsageResponse> for UsageResponse {
    type Error = MalformedInterval;

    fn try_from(raw: RawUsageResponse) -> Result<Self, Self::Error> {
        let usage_data = raw
            .usage_data
            .into_iter()
            .map(UsageRecord::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(UsageResponse {
            usage_data,
            total_items: raw.total_items,
        })
    }
}
