//! # Soil Relay
//!
//! Correlates two sensor streams from a microbial fuel cell deployment and relays
//! one combined record per measurement cycle.
//!
//! A RocketLogger power logger connects once per cycle over a local socket and
//! streams voltage/current rows; a TEROS soil sensor stream stays connected and
//! delivers moisture, temperature and conductivity rows. Both are decoded
//! incrementally, reduced to running means, and when both have contributed enough
//! rows the means are formatted into a short payload and sent over a LoRa radio or
//! an HTTP endpoint.
//!
//! ## Crate Structure
//!
//! - **`decoder`**: incremental delimited-row decoder emitting field and row-end
//!   events through the `RowSink` trait.
//! - **`mapper`**: column-to-channel tables for the two stream kinds and lenient
//!   numeric parsing.
//! - **`aggregate`**: per-stream online means with header skipping.
//! - **`pipeline`**: decoder, mapper and aggregate wired together for one stream.
//! - **`correlator`**: the cycle state machine owning both pipelines.
//! - **`record`**: the combined record and its length-checked payload builder.
//! - **`transport`**: non-blocking stream endpoints (Unix sockets, in-memory).
//! - **`dispatch`**: the radio and network sinks behind `TransportDispatcher`.
//! - **`relay`**: the poll loop driving everything above.
//! - **`replay`**: a producer that streams a recorded file into a socket.
//! - **`config`**, **`logging`**, **`error`**: ambient configuration, tracing setup
//!   and the crate error type.

pub mod aggregate;
pub mod config;
pub mod correlator;
pub mod decoder;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod mapper;
pub mod pipeline;
pub mod record;
pub mod relay;
pub mod replay;
pub mod transport;

pub use config::RelayConfig;
pub use correlator::{CycleCorrelator, CycleState};
pub use error::{RelayError, RelayResult};
pub use record::CombinedRecord;
pub use relay::{Relay, TickOutcome};
