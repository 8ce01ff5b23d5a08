use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::types::{Granularity, RawUsageResponse, ServiceConnection, UsageResponse};

const DEFAULT_BASE_URL: &str = "https://app.hydrolink.io";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status} from {endpoint}")]
    Status {
        status: StatusCode,
        endpoint: String,
    },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("time format error: {0}")]
    Format(#[from] time::error::Format),
}

impl ClientError {
    /// True when the failure indicates bad or expired credentials rather
    /// than a transport problem.
    pub fn is_auth(&self) -> bool {
        match self {
            ClientError::Auth(_) => true,
            ClientError::Status { status, .. } => {
                *status == StatusCode::UNAUTHORIZED || *status == StatusCode::FORBIDDEN
            }
            _ => false,
        }
    }
}

/// Blocking view of the HydroLink customer portal. Callers on an async
/// runtime dispatch these through `spawn_blocking`; the client itself is
/// safe to share across threads (session cookies live inside it).
pub trait HydroLinkApi: Send + Sync {
    fn login(&self, username: &str, password: &str) -> Result<bool, ClientError>;
    fn is_logged_in(&self) -> bool;
    fn logout(&self) -> Result<(), ClientError>;
    fn list_service_connections(&self) -> Result<Vec<ServiceConnection>, ClientError>;
    fn get_service_connection(&self, id: i64) -> Result<Option<ServiceConnection>, ClientError>;
    fn get_usage(
        &self,
        connection_id: i64,
        start: OffsetDateTime,
        end: OffsetDateTime,
        granularity: Granularity,
    ) -> Result<UsageResponse, ClientError>;
}

pub struct HydroLinkClient {
    http: Client,
    base_url: String,
    logged_in: AtomicBool,
}

impl HydroLinkClient {
    pub fn new(base_url: Option<&str>) -> Result<Self, ClientError> {
        let http = Client::builder()
            .cookie_store(true)
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("hydrolink-client/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            logged_in: AtomicBool::new(false),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn check_status(resp: Response, endpoint: &str) -> Result<Response, ClientError> {
        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ClientError::Auth(format!("{endpoint} returned {status}")));
        }
        if !status.is_success() {
            return Err(ClientError::Status {
                status,
                endpoint: endpoint.to_string(),
            });
        }
        Ok(resp)
    }
}

impl HydroLinkApi for HydroLinkClient {
    fn login(&self, username: &str, password: &str) -> Result<bool, ClientError> {
        let resp = self
            .http
            .post(self.url("/login"))
            .json(&serde_json::json!({ "email": username, "password": password }))
            .send()?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            self.logged_in.store(false, Ordering::SeqCst);
            return Ok(false);
        }
        if !status.is_success() {
            return Err(ClientError::Status {
                status,
                endpoint: "/login".to_string(),
            });
        }

        self.logged_in.store(true, Ordering::SeqCst);
        Ok(true)
    }

    fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }

    fn logout(&self) -> Result<(), ClientError> {
        let resp = self.http.post(self.url("/logout")).send()?;
        self.logged_in.store(false, Ordering::SeqCst);
        Self::check_status(resp, "/logout").map(|_| ())
    }

    fn list_service_connections(&self) -> Result<Vec<ServiceConnection>, ClientError> {
        let endpoint = "/api/service_connections";
        let resp = self.http.get(self.url(endpoint)).send()?;
        let resp = Self::check_status(resp, endpoint)?;
        let connections: Vec<ServiceConnection> = resp
            .json()
            .map_err(|e| ClientError::Malformed(e.to_string()))?;
        Ok(connections)
    }

    fn get_service_connection(&self, id: i64) -> Result<Option<ServiceConnection>, ClientError> {
        let endpoint = format!("/api/service_connections/{id}");
        let resp = self.http.get(self.url(&endpoint)).send()?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = Self::check_status(resp, &endpoint)?;
        let connection: ServiceConnection = resp
            .json()
            .map_err(|e| ClientError::Malformed(e.to_string()))?;
        Ok(Some(connection))
    }

    fn get_usage(
        &self,
        connection_id: i64,
        start: OffsetDateTime,
        end: OffsetDateTime,
        granularity: Granularity,
    ) -> Result<UsageResponse, ClientError> {
        let endpoint = format!("/api/service_connections/{connection_id}/usage");
        let resp = self
            .http
            .get(self.url(&endpoint))
            .query(&[
                ("start", start.format(&Rfc3339)?),
                ("end", end.format(&Rfc3339)?),
                ("period", granularity.as_str().to_string()),
            ])
            .send()?;
        let resp = Self::check_status(resp, &endpoint)?;

        let raw: RawUsageResponse = resp
            .json()
            .map_err(|e| ClientError::Malformed(e.to_string()))?;
        let mut response =
            UsageResponse::try_from(raw).map_err(|e| ClientError::Malformed(e.to_string()))?;

        // Consumers rely on ascending order.
        response.usage_data.sort_by(|a, b| a.start.cmp(&b.start));

        Ok(response)
    }
}
