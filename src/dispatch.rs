use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::Value;

use crate::{
    lookup::{Endpoints, LookupType, UnknownType},
    upi::{self, UpiEndpoint, UpiError},
};

#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("Invalid type")]
    InvalidType(#[from] UnknownType),

    #[error("Upstream request failed: {0}")]
    Fetch(#[source] reqwest::Error),

    #[error("Upstream responded with status {0}")]
    Status(StatusCode),

    #[error("Upstream response is not valid JSON: {0}")]
    Decode(#[source] serde_json::Error),
}

impl LookupError {
    /// Whether the failure happened on the upstream side rather than in the
    /// caller's input.
    #[must_use]
    pub fn is_upstream(&self) -> bool {
        !matches!(self, Self::InvalidType(_))
    }
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    client: Client,
    endpoints: Endpoints,
    upi: Option<UpiEndpoint>,
}

impl Dispatcher {
    pub fn new(
        endpoints: Endpoints,
        timeout: Option<Duration>,
    ) -> reqwest::Result<Self> {
        let mut builder = Client::builder()
            .user_agent(concat!(
                env!("CARGO_PKG_NAME"),
                "/",
                env!("CARGO_PKG_VERSION")
            ));
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build()?;
        Ok(Self {
            client,
            endpoints,
            upi: None,
        })
    }

    #[must_use]
    pub fn with_upi(mut self, upi: Option<UpiEndpoint>) -> Self {
        self.upi = upi;
        self
    }

    pub async fn lookup_upi(&self, upi_id: &str) -> Result<Value, UpiError> {
        let endpoint = self.upi.as_ref().ok_or(UpiError::Disabled)?;
        upi::resolve(&self.client, endpoint, upi_id).await
    }

    /// Resolves the tag before anything goes out on the wire.
    pub async fn lookup(
        &self,
        kind: &str,
        term: &str,
    ) -> Result<Value, LookupError> {
        let kind: LookupType = kind.parse()?;
        self.lookup_typed(kind, term).await
    }

    #[tracing::instrument(skip(self, term), fields(term_len = term.len()))]
    pub async fn lookup_typed(
        &self,
        kind: LookupType,
        term: &str,
    ) -> Result<Value, LookupError> {
        let endpoint = self
            .endpoints
            .get(kind)
            .ok_or_else(|| UnknownType(kind.to_string()))?;
        let url = endpoint.url(term);
        tracing::debug!(host = ?url.host_str(), "Forwarding lookup upstream.");
        let response =
            self.client.get(url).send().await.map_err(LookupError::Fetch)?;
        let status = response.status();
        if !status.is_success() {
            tracing::warn!(?status, "Upstream returned non-success.");
            return Err(LookupError::Status(status));
        }
        let body = response.bytes().await.map_err(LookupError::Fetch)?;
        let value =
            serde_json::from_slice(&body).map_err(LookupError::Decode)?;
        tracing::debug!(body_len = body.len(), "Upstream lookup succeeded.");
        Ok(value)
    }
}
