use std::sync::Arc;
use std::time::{Duration, Instant};

use hydrolink_client::{HydroLinkApi, ServiceConnection};
use tokio::sync::Mutex;

use crate::error::PollError;

/// Connection listings change rarely; callers within this window share one
/// upstream fetch.
pub const CACHE_TTL: Duration = Duration::from_secs(5 * 60);

struct CacheSlot {
    connections: Vec<ServiceConnection>,
    fetched_at: Instant,
}

/// TTL cache over the account's service connection list. The slot lock is
/// held across refreshes, so concurrent callers wait for one fetch instead
/// of racing their own.
pub struct ConnectionCache {
    client: Arc<dyn HydroLinkApi>,
    ttl: Duration,
    slot: Mutex<Option<CacheSlot>>,
}

impl ConnectionCache {
    pub fn new(client: Arc<dyn HydroLinkApi>) -> Self {
        Self::with_ttl(client, CACHE_TTL)
    }

    pub fn with_ttl(client: Arc<dyn HydroLinkApi>, ttl: Duration) -> Self {
        Self {
            client,
            ttl,
            slot: Mutex::new(None),
        }
    }

    /// Cached listing, refreshed when older than the TTL. A failed refresh
    /// falls back to the stale copy when one exists.
    pub async fn get_connections(&self) -> Result<Vec<ServiceConnection>, PollError> {
        let mut slot = self.slot.lock().await;
        if let Some(cached) = slot.as_ref() {
            if cached.fetched_at.elapsed() < self.ttl {
                return Ok(cached.connections.clone());
            }
        }

        match self.fetch().await {
            Ok(connections) => {
                *slot = Some(CacheSlot {
                    connections: connections.clone(),
                    fetched_at: Instant::now(),
                });
                Ok(connections)
            }
            Err(e) => match slot.as_ref() {
                Some(stale) => {
                    tracing::warn!(
                        error = %e,
                        age_secs = stale.fetched_at.elapsed().as_secs(),
                        "connection refresh failed, serving stale listing"
                    );
                    metrics::counter!("connection_cache_stale_serves_total").increment(1);
                    Ok(stale.connections.clone())
                }
                None => Err(e),
            },
        }
    }

    /// Unconditional refetch, used by the connection poller.
    pub async fn refresh(&self) -> Result<usize, PollError> {
        let connections = self.fetch().await?;
        let count = connections.len();
        let mut slot = self.slot.lock().await;
        *slot = Some(CacheSlot {
            connections,
            fetched_at: Instant::now(),
        });
        Ok(count)
    }

    async fn fetch(&self) -> Result<Vec<ServiceConnection>, PollError> {
        let client = Arc::clone(&self.client);
        tokio::task::spawn_blocking(move || client.list_service_connections())
            .await
            .map_err(|e| PollError::Task(e.to_string()))?
            .map_err(PollError::from)
    }
}
