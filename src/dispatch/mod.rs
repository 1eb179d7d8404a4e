//! Transport dispatcher: hands each completed cycle's record to exactly one sink.
//!
//! The sink is selected once at startup from [`TransportConfig`]. Sends are never
//! retried; a failure is reported to the caller and the payload for that cycle is
//! lost.

pub mod network;
pub mod radio;

use crate::config::{TransportConfig, TransportKind};
use crate::error::{RelayError, RelayResult};
use crate::record::CombinedRecord;
use async_trait::async_trait;

pub use network::{HttpEgress, NetworkEgress, NetworkSink};
pub use radio::{ControlChannel, LoraModem, ModemPort, RadioSink};

/// A destination for combined records.
#[async_trait]
pub trait PayloadSink: Send {
    /// Short name for logs ("radio", "network").
    fn name(&self) -> &str;

    /// Format and deliver `record`, returning the payload that was sent.
    async fn send(&mut self, record: &CombinedRecord) -> RelayResult<String>;
}

/// Owns the sink selected at startup.
pub struct TransportDispatcher {
    sink: Box<dyn PayloadSink>,
}

impl std::fmt::Debug for TransportDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportDispatcher")
            .field("sink", &self.sink.name())
            .finish()
    }
}

impl TransportDispatcher {
    /// Use an already constructed sink.
    pub fn new(sink: Box<dyn PayloadSink>) -> Self {
        Self { sink }
    }

    /// Open the sink named by `config.kind`.
    ///
    /// For the radio this performs the modem handshake, so a missing or
    /// unresponsive modem fails startup.
    pub async fn connect(config: &TransportConfig) -> RelayResult<Self> {
        match config.kind {
            TransportKind::Radio => {
                let radio = config.radio.as_ref().ok_or_else(|| {
                    RelayError::Configuration("transport.radio section is required".to_string())
                })?;
                let modem = LoraModem::open(radio).await?;
                Ok(Self::new(Box::new(RadioSink::new(
                    modem,
                    radio.max_payload_len,
                ))))
            }
            TransportKind::Network => {
                let network = config.network.as_ref().ok_or_else(|| {
                    RelayError::Configuration("transport.network section is required".to_string())
                })?;
                let egress = HttpEgress::new(network)?;
                Ok(Self::new(Box::new(NetworkSink::new(egress, network))))
            }
        }
    }

    /// Name of the selected sink.
    pub fn sink_name(&self) -> &str {
        self.sink.name()
    }

    /// Deliver one record. No retries.
    pub async fn send(&mut self, record: &CombinedRecord) -> RelayResult<String> {
        self.sink.send(record).await
    }
}
