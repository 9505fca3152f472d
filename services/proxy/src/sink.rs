//! Metrics Sink client.
//!
//! Every stream record is posted as JSON to
//! `{base_url}/v1/telemetry/<stream>` with a bearer token. Failures are
//! returned to the caller, which counts and drops them.

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;
use tunnelgate_telemetry::{SimpleConnectionAck, SimpleConnectionEvent, StreamRecord};

use crate::config::SinkConfig;

/// Errors from a single sink request.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("sink request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("sink rejected {path}: {status} {body}")]
    Rejected {
        path: String,
        status: u16,
        body: String,
    },
}

impl SinkError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Destination for aggregated telemetry.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    /// Post one record for `port` to its stream.
    async fn push(&self, port: u16, record: &StreamRecord) -> Result<(), SinkError>;

    /// Post a single simple connection event.
    async fn push_simple(
        &self,
        event: &SimpleConnectionEvent,
    ) -> Result<SimpleConnectionAck, SinkError>;
}

/// HTTP implementation of [`MetricsSink`].
pub struct SinkClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl SinkClient {
    pub fn new(config: &SinkConfig) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(SinkError::Client)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    async fn post<T: serde::Serialize + ?Sized + Sync>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<reqwest::Response, SinkError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Rejected {
                path: path.to_string(),
                status,
                body,
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl MetricsSink for SinkClient {
    async fn push(&self, port: u16, record: &StreamRecord) -> Result<(), SinkError> {
        let path = format!("/v1/telemetry/{}", record.stream().path());
        self.post(&path, &record.envelope(port)).await?;
        Ok(())
    }

    async fn push_simple(
        &self,
        event: &SimpleConnectionEvent,
    ) -> Result<SimpleConnectionAck, SinkError> {
        let response = self.post("/v1/connections", event).await?;
        let ack: SimpleConnectionAck = response.json().await?;
        debug!(
            status = %ack.status,
            port = ack.port,
            client = %ack.client,
            "Simple connection event acknowledged"
        );
        Ok(ack)
    }
}
