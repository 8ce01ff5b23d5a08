pub mod api;
pub mod config;
pub mod connections;
pub mod coordinator;
pub mod detector;
pub mod error;
pub mod merger;
pub mod metrics_server;
pub mod observability;
pub mod sensors;
pub mod statistics;

pub use coordinator::{AppState, PollHealth, UsageSnapshot};
