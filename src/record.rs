//! The per-cycle combined record and its textual payload.
//!
//! Payload layout (fixed order):
//! `timestamp,voltage1,current1,voltage2,current2,moisture,temperature,conductivity`
//!
//! Integer-typed fields are truncated toward zero; moisture and temperature carry
//! six fractional digits.

use crate::error::{RelayError, RelayResult};
use serde::Serialize;
use std::fmt::Write as _;

/// Upper bound for payloads on sinks without a transport limit.
pub const UNBOUNDED_PAYLOAD_LEN: usize = 4096;

/// Immutable snapshot of one completed cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CombinedRecord {
    /// Latest soil timestamp, else latest logger timestamp, else 0.
    pub timestamp: f64,
    /// Mean logger channel 1 voltage.
    pub voltage1: f64,
    /// Mean logger channel 1 current.
    pub current1: f64,
    /// Mean logger channel 2 voltage.
    pub voltage2: f64,
    /// Mean logger channel 2 current.
    pub current2: f64,
    /// Mean volumetric water content.
    pub moisture: f64,
    /// Mean soil temperature.
    pub temperature: f64,
    /// Mean bulk conductivity.
    pub conductivity: f64,
}

impl CombinedRecord {
    /// Serialize into the fixed payload, failing if it exceeds `max_len` bytes.
    pub fn to_payload(&self, max_len: usize) -> RelayResult<String> {
        let mut builder = PayloadBuilder::with_limit(max_len);
        builder.push_int(self.timestamp);
        builder.push_int(self.voltage1);
        builder.push_int(self.current1);
        builder.push_int(self.voltage2);
        builder.push_int(self.current2);
        builder.push_fixed(self.moisture);
        builder.push_fixed(self.temperature);
        builder.push_int(self.conductivity);
        builder.finish()
    }
}

/// Comma-joined payload assembly with an explicit length contract.
///
/// Nothing is ever truncated: [`PayloadBuilder::finish`] fails instead.
#[derive(Debug)]
pub struct PayloadBuilder {
    buf: String,
    limit: usize,
}

impl PayloadBuilder {
    /// Empty builder whose output may be at most `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buf: String::with_capacity(limit.min(UNBOUNDED_PAYLOAD_LEN)),
            limit,
        }
    }

    /// Append a value truncated toward zero.
    pub fn push_int(&mut self, value: f64) {
        self.separator();
        // `as` saturates and maps NaN to 0
        let _ = write!(self.buf, "{}", value.trunc() as i64);
    }

    /// Append a value with six fractional digits.
    pub fn push_fixed(&mut self, value: f64) {
        self.separator();
        let _ = write!(self.buf, "{value:.6}");
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True before the first value is pushed.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The payload, or `PayloadTooLong` if it outgrew the limit.
    pub fn finish(self) -> RelayResult<String> {
        if self.buf.len() > self.limit {
            return Err(RelayError::PayloadTooLong {
                len: self.buf.len(),
                max: self.limit,
            });
        }
        Ok(self.buf)
    }

    fn separator(&mut self) {
        if !self.buf.is_empty() {
            self.buf.push(',');
        }
    }
}
