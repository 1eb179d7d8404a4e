//! Incremental delimited row decoder.
//!
//! [`RowDecoder`] turns an unbounded byte stream into field and row-end events without
//! ever holding more than the field currently being assembled. Chunks may split a
//! field or a row anywhere; the in-progress field survives between calls to
//! [`RowDecoder::feed`].
//!
//! Tokenising is delegated to `csv-core`, which is allocation free and already
//! resumable at arbitrary byte boundaries. The decoder only owns the field buffer
//! and the column cursor.

use csv_core::{ReadFieldResult, Reader, ReaderBuilder};
use thiserror::Error;

/// Receiver of decoder events.
///
/// Field bytes are only valid for the duration of the call; the decoder reuses the
/// buffer for the next field.
pub trait RowSink {
    /// A field completed at `column` (0-based within the current row).
    fn on_field(&mut self, column: usize, bytes: &[u8]);

    /// The current row was terminated.
    fn on_row_end(&mut self);
}

/// Failure to decode a chunk.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The decoder stopped before the end of the chunk.
    #[error("decoder consumed {consumed} of {expected} bytes (field limit {limit} bytes)")]
    Incomplete {
        /// Bytes decoded before stopping.
        consumed: usize,
        /// Bytes in the chunk.
        expected: usize,
        /// Field limit in effect.
        limit: usize,
    },
}

/// Streaming row/field decoder with a bounded field buffer.
pub struct RowDecoder {
    reader: Reader,
    field: Vec<u8>,
    field_len: usize,
    column: usize,
    delimiter: u8,
}

impl std::fmt::Debug for RowDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowDecoder")
            .field("field_len", &self.field_len)
            .field("field_limit", &self.field_limit())
            .field("column", &self.column)
            .field("delimiter", &(self.delimiter as char))
            .finish()
    }
}

impl RowDecoder {
    /// Create a comma-delimited decoder whose fields may be at most `max_field_len` bytes.
    pub fn new(max_field_len: usize) -> Self {
        Self::with_delimiter(b',', max_field_len)
    }

    /// Create a decoder for a custom field delimiter.
    pub fn with_delimiter(delimiter: u8, max_field_len: usize) -> Self {
        Self {
            reader: ReaderBuilder::new().delimiter(delimiter).build(),
            // csv-core reports a full buffer before it sees the next delimiter.
            field: vec![0; max_field_len.max(1) + 1],
            field_len: 0,
            column: 0,
            delimiter,
        }
    }

    /// Longest field, in bytes, this decoder accepts.
    pub fn field_limit(&self) -> usize {
        self.field.len() - 1
    }

    /// Column index of the field currently being assembled.
    pub fn column(&self) -> usize {
        self.column
    }

    /// Decode `chunk`, emitting events into `sink` in arrival order.
    ///
    /// Returns the number of bytes consumed. This is `chunk.len()` unless a field
    /// outgrew the field buffer, in which case decoding stops at that point.
    pub fn feed<S: RowSink + ?Sized>(&mut self, chunk: &[u8], sink: &mut S) -> usize {
        let mut input = chunk;
        let mut consumed = 0;

        // An empty slice means end-of-input to csv-core, so never hand it one here.
        while !input.is_empty() {
            let (result, nin, nout) = self.reader.read_field(input, &mut self.field[self.field_len..]);
            input = &input[nin..];
            consumed += nin;
            self.field_len += nout;

            match result {
                ReadFieldResult::InputEmpty => break,
                ReadFieldResult::OutputFull => {
                    tracing::debug!(
                        limit = self.field_limit(),
                        column = self.column,
                        "field exceeds decoder buffer"
                    );
                    break;
                }
                ReadFieldResult::Field { record_end } => self.emit_field(record_end, sink),
                ReadFieldResult::End => break,
            }
        }

        consumed
    }

    /// Decode `chunk` and fail unless every byte was consumed.
    pub fn feed_all<S: RowSink + ?Sized>(
        &mut self,
        chunk: &[u8],
        sink: &mut S,
    ) -> Result<(), DecodeError> {
        let consumed = self.feed(chunk, sink);
        if consumed == chunk.len() {
            Ok(())
        } else {
            Err(DecodeError::Incomplete {
                consumed,
                expected: chunk.len(),
                limit: self.field_limit(),
            })
        }
    }

    /// Signal end of input: a trailing row without a terminator is completed.
    ///
    /// The decoder is ready for a fresh stream afterwards.
    pub fn finish<S: RowSink + ?Sized>(&mut self, sink: &mut S) {
        loop {
            let (result, _, nout) = self.reader.read_field(&[], &mut self.field[self.field_len..]);
            self.field_len += nout;
            match result {
                ReadFieldResult::Field { record_end } => self.emit_field(record_end, sink),
                ReadFieldResult::End | ReadFieldResult::InputEmpty | ReadFieldResult::OutputFull => {
                    break
                }
            }
        }
        self.reset();
    }

    /// Drop any in-progress field and start over at column 0.
    pub fn reset(&mut self) {
        self.reader.reset();
        self.field_len = 0;
        self.column = 0;
    }

    fn emit_field<S: RowSink + ?Sized>(&mut self, record_end: bool, sink: &mut S) {
        sink.on_field(self.column, &self.field[..self.field_len]);
        self.field_len = 0;
        if record_end {
            sink.on_row_end();
            self.column = 0;
        } else {
            self.column += 1;
        }
    }
}
