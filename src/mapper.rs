//! Field-to-channel mapping for the two sensor streams.
//!
//! Each stream has a fixed column layout. Columns without a channel (the
//! RocketLogger range-valid flags, the high-range currents, the TEROS sensor id)
//! are decoded by the row decoder but dropped here.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The two independently clocked producers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// RocketLogger electrical logger (voltage/current).
    Logger,
    /// TEROS-12 soil sensor (moisture/temperature/conductivity).
    Soil,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Logger => f.write_str("rocketlogger"),
            StreamKind::Soil => f.write_str("teros"),
        }
    }
}

/// Semantic measurement slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Row timestamp, tracked but never averaged.
    Timestamp,
    /// Logger channel 1 voltage.
    Voltage1,
    /// Logger channel 1 current (low range).
    Current1,
    /// Logger channel 2 voltage.
    Voltage2,
    /// Logger channel 2 current (low range).
    Current2,
    /// Volumetric water content.
    Moisture,
    /// Soil temperature.
    Temperature,
    /// Bulk electrical conductivity.
    Conductivity,
}

impl Channel {
    /// Number of distinct channels.
    pub const COUNT: usize = 8;

    /// Dense index, used to address per-channel slots.
    pub const fn index(self) -> usize {
        match self {
            Channel::Timestamp => 0,
            Channel::Voltage1 => 1,
            Channel::Current1 => 2,
            Channel::Voltage2 => 3,
            Channel::Current2 => 4,
            Channel::Moisture => 5,
            Channel::Temperature => 6,
            Channel::Conductivity => 7,
        }
    }
}

/// A decoded value tagged with its channel. Only lives for one field event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelSample {
    /// Slot the value belongs to.
    pub channel: Channel,
    /// Parsed value, `0` when the field did not parse.
    pub value: f64,
}

// RocketLogger columns: TIMESTAMP, I1L_VALID, I2L_VALID, I1H, I1L, V1, V2, I2H, I2L
const LOGGER_COLUMNS: &[(usize, Channel)] = &[
    (0, Channel::Timestamp),
    (4, Channel::Current1),
    (5, Channel::Voltage1),
    (6, Channel::Voltage2),
    (8, Channel::Current2),
];

// TEROS columns: TIMESTAMP, SENSOR_ID, MOISTURE, TEMP, CONDUCTIVITY
const SOIL_COLUMNS: &[(usize, Channel)] = &[
    (0, Channel::Timestamp),
    (2, Channel::Moisture),
    (3, Channel::Temperature),
    (4, Channel::Conductivity),
];

const LOGGER_MEANS: &[Channel] = &[
    Channel::Voltage1,
    Channel::Current1,
    Channel::Voltage2,
    Channel::Current2,
];

const SOIL_MEANS: &[Channel] = &[Channel::Moisture, Channel::Temperature, Channel::Conductivity];

impl StreamKind {
    /// Fixed column table for this stream.
    pub fn columns(self) -> &'static [(usize, Channel)] {
        match self {
            StreamKind::Logger => LOGGER_COLUMNS,
            StreamKind::Soil => SOIL_COLUMNS,
        }
    }

    /// Channels this stream contributes running means for (timestamp excluded).
    pub fn averaged_channels(self) -> &'static [Channel] {
        match self {
            StreamKind::Logger => LOGGER_MEANS,
            StreamKind::Soil => SOIL_MEANS,
        }
    }

    /// Channel carried in `column`, if any.
    pub fn channel_at(self, column: usize) -> Option<Channel> {
        self.columns()
            .iter()
            .find(|(c, _)| *c == column)
            .map(|(_, channel)| *channel)
    }
}

/// Maps raw fields of one stream onto channels, skipping the header region.
#[derive(Debug, Clone, Copy)]
pub struct FieldMapper {
    kind: StreamKind,
    header_rows: u64,
}

impl FieldMapper {
    /// Mapper for `kind` that ignores the first `header_rows` rows.
    pub fn new(kind: StreamKind, header_rows: u64) -> Self {
        Self { kind, header_rows }
    }

    /// Stream this mapper reads.
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Rows skipped at the start of each connection.
    pub fn header_rows(&self) -> u64 {
        self.header_rows
    }

    /// Map the field at `column` of stream row `stream_row` (0-based).
    ///
    /// Returns `None` inside the header region and for unmapped columns. A mapped
    /// field that does not parse yields `0`.
    pub fn map(&self, column: usize, stream_row: u64, raw: &[u8]) -> Option<ChannelSample> {
        if stream_row < self.header_rows {
            return None;
        }
        let channel = self.kind.channel_at(column)?;
        Some(ChannelSample {
            channel,
            value: parse_numeric(raw),
        })
    }
}

/// Parse a field as a finite decimal number, falling back to `0`.
pub fn parse_numeric(raw: &[u8]) -> f64 {
    let parsed = std::str::from_utf8(raw)
        .ok()
        .map(str::trim)
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|v| v.is_finite());

    match parsed {
        Some(value) => value,
        None => {
            tracing::trace!(field = %String::from_utf8_lossy(raw), "unparsable field, using 0");
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logger_columns_map_to_electrical_channels() {
        let mapper = FieldMapper::new(StreamKind::Logger, 0);
        let cases = [
            (0, Some(Channel::Timestamp)),
            (1, None),
            (2, None),
            (3, None),
            (4, Some(Channel::Current1)),
            (5, Some(Channel::Voltage1)),
            (6, Some(Channel::Voltage2)),
            (7, None),
            (8, Some(Channel::Current2)),
            (9, None),
        ];
        for (column, expected) in cases {
            assert_eq!(
                mapper.map(column, 0, b"5").map(|s| s.channel),
                expected,
                "column {column}"
            );
        }
    }

    #[test]
    fn soil_columns_map_to_soil_channels() {
        let mapper = FieldMapper::new(StreamKind::Soil, 0);
        assert_eq!(mapper.map(1, 0, b"3").map(|s| s.channel), None);
        assert_eq!(
            mapper.map(2, 0, b"0.35"),
            Some(ChannelSample {
                channel: Channel::Moisture,
                value: 0.35
            })
        );
        assert_eq!(mapper.map(3, 0, b"21.6").map(|s| s.channel), Some(Channel::Temperature));
        assert_eq!(mapper.map(4, 0, b"300").map(|s| s.channel), Some(Channel::Conductivity));
    }

    #[test]
    fn header_rows_are_skipped() {
        let mapper = FieldMapper::new(StreamKind::Soil, 2);
        assert!(mapper.map(2, 0, b"1.0").is_none());
        assert!(mapper.map(2, 1, b"1.0").is_none());
        assert!(mapper.map(2, 2, b"1.0").is_some());
    }

    #[test]
    fn unparsable_fields_default_to_zero() {
        assert_eq!(parse_numeric(b"abc"), 0.0);
        assert_eq!(parse_numeric(b""), 0.0);
        assert_eq!(parse_numeric(b"nan"), 0.0);
        assert_eq!(parse_numeric(b"inf"), 0.0);
        assert_eq!(parse_numeric(&[0xff, 0xfe]), 0.0);
        assert_eq!(parse_numeric(b" 42 "), 42.0);
        assert_eq!(parse_numeric(b"-1.5e3"), -1500.0);
    }

    #[test]
    fn channel_indices_are_dense() {
        let all = [
            Channel::Timestamp,
            Channel::Voltage1,
            Channel::Current1,
            Channel::Voltage2,
            Channel::Current2,
            Channel::Moisture,
            Channel::Temperature,
            Channel::Conductivity,
        ];
        for (i, channel) in all.iter().enumerate() {
            assert_eq!(channel.index(), i);
        }
        assert_eq!(all.len(), Channel::COUNT);
    }
}
