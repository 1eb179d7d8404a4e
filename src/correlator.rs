//! Cycle correlator: owns both stream pipelines and decides when a cycle is done.
//!
//! Correlation is by sample count only. A cycle completes when the logger stream
//! has contributed at least `min_logger_samples` post-header rows and the soil
//! stream at least `min_soil_rows`. Completion is checked once per tick; the
//! record is taken exactly once and both aggregates are reset before the next
//! cycle starts.
//!
//! ```text
//!   AwaitingLoggerConnection --attach_logger--> Accumulating
//!   Accumulating --try_emit (invariant holds)--> Emitting
//!   Accumulating --detach_logger (EOF, logger short)--> AwaitingLoggerConnection
//!   Emitting --finish_cycle--> AwaitingLoggerConnection
//! ```
//!
//! Soil data is accepted in every state.

use crate::config::{CycleConfig, StreamConfig};
use crate::error::{RelayError, RelayResult};
use crate::mapper::{Channel, StreamKind};
use crate::pipeline::StreamPipeline;
use crate::record::CombinedRecord;
use std::fmt;

/// State of the correlation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    /// No logger endpoint attached.
    AwaitingLoggerConnection,
    /// Logger attached, both streams being read.
    Accumulating,
    /// Completion invariant held; record taken, reset pending.
    Emitting,
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CycleState::AwaitingLoggerConnection => "awaiting-logger-connection",
            CycleState::Accumulating => "accumulating",
            CycleState::Emitting => "emitting",
        };
        f.write_str(name)
    }
}

/// Owns both aggregates and the cycle state machine.
#[derive(Debug)]
pub struct CycleCorrelator {
    logger: StreamPipeline,
    soil: StreamPipeline,
    min_logger_samples: u64,
    min_soil_rows: u64,
    state: CycleState,
    cycles_completed: u64,
}

impl CycleCorrelator {
    /// Build a correlator from stream and cycle settings.
    ///
    /// Thresholds below 1 are raised to 1 so a record is never built from an
    /// empty aggregate.
    pub fn new(streams: &StreamConfig, cycle: &CycleConfig) -> Self {
        Self {
            logger: StreamPipeline::new(
                StreamKind::Logger,
                streams.logger_header_rows,
                streams.max_field_bytes,
            ),
            soil: StreamPipeline::new(
                StreamKind::Soil,
                streams.soil_header_rows,
                streams.max_field_bytes,
            ),
            min_logger_samples: cycle.min_logger_samples.max(1),
            min_soil_rows: cycle.min_soil_rows.max(1),
            state: CycleState::AwaitingLoggerConnection,
            cycles_completed: 0,
        }
    }

    /// Current state machine state.
    pub fn state(&self) -> CycleState {
        self.state
    }

    /// Cycles emitted since start, delivered or not.
    pub fn cycles_completed(&self) -> u64 {
        self.cycles_completed
    }

    /// Read-only view of one stream's pipeline.
    pub fn pipeline(&self, stream: StreamKind) -> &StreamPipeline {
        match stream {
            StreamKind::Logger => &self.logger,
            StreamKind::Soil => &self.soil,
        }
    }

    fn pipeline_mut(&mut self, stream: StreamKind) -> &mut StreamPipeline {
        match stream {
            StreamKind::Logger => &mut self.logger,
            StreamKind::Soil => &mut self.soil,
        }
    }

    /// A logger producer connected; start (or continue) accumulating.
    pub fn attach_logger(&mut self) {
        self.logger.restart_connection();
        self.state = CycleState::Accumulating;
    }

    /// A soil producer connected. The aggregate for the cycle is kept.
    pub fn attach_soil(&mut self) {
        self.soil.restart_connection();
    }

    /// Push a chunk read from `stream`.
    ///
    /// Logger data outside [`CycleState::Accumulating`] has no endpoint to come
    /// from and is dropped.
    pub fn ingest(&mut self, stream: StreamKind, chunk: &[u8]) -> RelayResult<()> {
        if stream == StreamKind::Logger && self.state != CycleState::Accumulating {
            tracing::debug!(bytes = chunk.len(), state = %self.state, "dropping logger data");
            return Ok(());
        }
        self.pipeline_mut(stream)
            .ingest(chunk)
            .map_err(|source| RelayError::Decode { stream, source })
    }

    /// The producer of `stream` closed its end; flush its trailing row.
    pub fn end_of_stream(&mut self, stream: StreamKind) {
        self.pipeline_mut(stream).end_of_stream();
    }

    /// The logger closed its connection before the cycle completed.
    ///
    /// If it had not yet contributed `min_logger_samples` rows the correlator goes
    /// back to waiting for a logger, keeping both aggregates. Otherwise the cycle
    /// stays in [`CycleState::Accumulating`] until the soil stream catches up.
    /// Returns whether a new logger connection is now expected.
    pub fn detach_logger(&mut self) -> bool {
        if self.state != CycleState::Accumulating {
            return false;
        }
        if self.logger.aggregate().sample_count() >= self.min_logger_samples {
            return false;
        }
        self.state = CycleState::AwaitingLoggerConnection;
        true
    }

    /// The completion invariant.
    pub fn is_complete(&self) -> bool {
        self.logger.aggregate().sample_count() >= self.min_logger_samples
            && self.soil.aggregate().sample_count() >= self.min_soil_rows
    }

    /// Take the combined record if the cycle just completed.
    ///
    /// Moves to [`CycleState::Emitting`]; returns `None` in any other state or
    /// while the invariant does not hold.
    pub fn try_emit(&mut self) -> Option<CombinedRecord> {
        if self.state != CycleState::Accumulating || !self.is_complete() {
            return None;
        }
        self.state = CycleState::Emitting;
        Some(self.snapshot())
    }

    /// Reset both aggregates and wait for the next logger connection.
    ///
    /// The logger connection is one-shot, so its pipeline is fully restarted.
    pub fn finish_cycle(&mut self) {
        self.logger.reset_cycle();
        self.logger.restart_connection();
        self.soil.reset_cycle();
        if self.state == CycleState::Emitting {
            self.cycles_completed += 1;
        }
        self.state = CycleState::AwaitingLoggerConnection;
    }

    /// Current aggregate values as a record, whether or not the cycle is complete.
    pub fn snapshot(&self) -> CombinedRecord {
        let logger = self.logger.aggregate();
        let soil = self.soil.aggregate();
        CombinedRecord {
            timestamp: soil
                .last_timestamp()
                .or_else(|| logger.last_timestamp())
                .unwrap_or(0.0),
            voltage1: logger.mean(Channel::Voltage1),
            current1: logger.mean(Channel::Current1),
            voltage2: logger.mean(Channel::Voltage2),
            current2: logger.mean(Channel::Current2),
            moisture: soil.mean(Channel::Moisture),
            temperature: soil.mean(Channel::Temperature),
            conductivity: soil.mean(Channel::Conductivity),
        }
    }
}
