//! Network sink: one HTTP POST per cycle.

use super::PayloadSink;
use crate::config::NetworkConfig;
use crate::error::{RelayError, RelayResult};
use crate::record::{CombinedRecord, UNBOUNDED_PAYLOAD_LEN};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Header carrying the configured device name.
pub const DEVICE_HEADER: &str = "X-Device-Name";
/// Header carrying the configured group name.
pub const GROUP_HEADER: &str = "X-Group-Name";

/// Outbound call to a fixed endpoint.
#[async_trait]
pub trait NetworkEgress: Send + Sync {
    /// Post `payload` to `destination` with `metadata` attached as headers.
    async fn post(
        &self,
        destination: &str,
        metadata: &[(String, String)],
        payload: &str,
    ) -> RelayResult<()>;
}

/// Sends records through a [`NetworkEgress`], tagged with static metadata.
#[derive(Debug)]
pub struct NetworkSink<E> {
    egress: E,
    endpoint: String,
    metadata: Vec<(String, String)>,
}

impl<E: NetworkEgress> NetworkSink<E> {
    /// Sink posting to `config.endpoint` with the device and group headers.
    pub fn new(egress: E, config: &NetworkConfig) -> Self {
        Self {
            egress,
            endpoint: config.endpoint.clone(),
            metadata: vec![
                (DEVICE_HEADER.to_string(), config.device_name.clone()),
                (GROUP_HEADER.to_string(), config.group_name.clone()),
            ],
        }
    }

    /// Header name/value pairs sent with every payload.
    pub fn metadata(&self) -> &[(String, String)] {
        &self.metadata
    }
}

#[async_trait]
impl<E: NetworkEgress> PayloadSink for NetworkSink<E> {
    fn name(&self) -> &str {
        "network"
    }

    async fn send(&mut self, record: &CombinedRecord) -> RelayResult<String> {
        let payload = record.to_payload(UNBOUNDED_PAYLOAD_LEN)?;
        self.egress
            .post(&self.endpoint, &self.metadata, &payload)
            .await?;
        Ok(payload)
    }
}

/// [`NetworkEgress`] over HTTP. The body is `{"payload": "<payload>"}`.
#[derive(Debug, Clone)]
pub struct HttpEgress {
    client: reqwest::Client,
}

impl HttpEgress {
    /// Build the HTTP client with the configured request timeout.
    pub fn new(config: &NetworkConfig) -> RelayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| RelayError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl NetworkEgress for HttpEgress {
    async fn post(
        &self,
        destination: &str,
        metadata: &[(String, String)],
        payload: &str,
    ) -> RelayResult<()> {
        let mut request = self
            .client
            .post(destination)
            .json(&serde_json::json!({ "payload": payload }));
        for (name, value) in metadata {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| RelayError::Network(format!("POST {destination}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::Network(format!(
                "POST {destination} returned {status}"
            )));
        }
        debug!(%status, destination, "payload posted");
        Ok(())
    }
}
