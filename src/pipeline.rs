//! Decode → map → aggregate for a single stream.

use crate::aggregate::{AggregateState, RowDisposition};
use crate::decoder::{DecodeError, RowDecoder, RowSink};
use crate::mapper::{FieldMapper, StreamKind};

/// Field mapper and aggregate paired behind the decoder's [`RowSink`] interface.
#[derive(Debug)]
struct MappedAggregate {
    mapper: FieldMapper,
    aggregate: AggregateState,
    stream_rows: u64,
}

impl RowSink for MappedAggregate {
    fn on_field(&mut self, column: usize, bytes: &[u8]) {
        if let Some(sample) = self.mapper.map(column, self.stream_rows, bytes) {
            self.aggregate.stage(sample);
        }
    }

    fn on_row_end(&mut self) {
        self.stream_rows += 1;
        if let RowDisposition::Header = self.aggregate.complete_row() {
            tracing::trace!(stream = %self.mapper.kind(), row = self.stream_rows, "skipped header row");
        }
    }
}

/// Owns the decoder and aggregate for one stream type.
#[derive(Debug)]
pub struct StreamPipeline {
    decoder: RowDecoder,
    sink: MappedAggregate,
}

impl StreamPipeline {
    /// Pipeline for `kind` with a field limit of `max_field_len` bytes.
    pub fn new(kind: StreamKind, header_rows: u64, max_field_len: usize) -> Self {
        Self {
            decoder: RowDecoder::new(max_field_len),
            sink: MappedAggregate {
                mapper: FieldMapper::new(kind, header_rows),
                aggregate: AggregateState::new(kind, header_rows),
                stream_rows: 0,
            },
        }
    }

    /// Stream this pipeline reads.
    pub fn kind(&self) -> StreamKind {
        self.sink.mapper.kind()
    }

    /// Running means for the current cycle.
    pub fn aggregate(&self) -> &AggregateState {
        &self.sink.aggregate
    }

    /// Rows (header included) seen on the current connection.
    pub fn stream_rows(&self) -> u64 {
        self.sink.stream_rows
    }

    /// Push a chunk through decoder, mapper and aggregate.
    pub fn ingest(&mut self, chunk: &[u8]) -> Result<(), DecodeError> {
        self.decoder.feed_all(chunk, &mut self.sink)
    }

    /// The producer closed its end: complete any trailing row.
    pub fn end_of_stream(&mut self) {
        self.decoder.finish(&mut self.sink);
    }

    /// Cycle boundary: zero means and sample count, keep connection progress.
    pub fn reset_cycle(&mut self) {
        self.sink.aggregate.reset();
    }

    /// A new producer connection: forget the decoder state and header progress.
    ///
    /// The running means belong to the cycle and survive reconnects.
    pub fn restart_connection(&mut self) {
        self.decoder.reset();
        self.sink.aggregate.restart_header();
        self.sink.stream_rows = 0;
    }
}
