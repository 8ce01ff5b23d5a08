pub mod client;
pub mod types;

pub use client::{ClientError, HydroLinkApi, HydroLinkClient};
pub use types::{Granularity, ServiceConnection, UsageRecord, UsageResponse};
