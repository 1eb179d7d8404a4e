//! Running per-channel means for one stream.
//!
//! The mean is updated online with `mean += (value - mean) / n`, so memory stays
//! constant no matter how many rows a cycle spans. The first post-header row is
//! sample 1.
//!
//! Field values for a row are staged and folded in when the row terminates. A
//! tracked channel missing from a short row is folded in as `0`, so every mean is
//! always over exactly [`AggregateState::sample_count`] values.

use crate::mapper::{Channel, ChannelSample, StreamKind};

/// What [`AggregateState::complete_row`] did with the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowDisposition {
    /// The row was part of the header region and was discarded.
    Header,
    /// The row became sample `n` (1-based).
    Sample(u64),
}

/// Aggregate state of one stream.
#[derive(Debug, Clone)]
pub struct AggregateState {
    kind: StreamKind,
    header_rows: u64,
    header_rows_seen: u64,
    sample_count: u64,
    means: [f64; Channel::COUNT],
    staged: [Option<f64>; Channel::COUNT],
    staged_timestamp: Option<f64>,
    last_timestamp: Option<f64>,
}

impl AggregateState {
    /// Empty aggregate that skips the first `header_rows` rows of each connection.
    pub fn new(kind: StreamKind, header_rows: u64) -> Self {
        Self {
            kind,
            header_rows,
            header_rows_seen: 0,
            sample_count: 0,
            means: [0.0; Channel::COUNT],
            staged: [None; Channel::COUNT],
            staged_timestamp: None,
            last_timestamp: None,
        }
    }

    /// Stream this aggregate belongs to.
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Completed post-header rows in the current cycle.
    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    /// Header rows seen on the current connection.
    pub fn header_rows_seen(&self) -> u64 {
        self.header_rows_seen
    }

    /// Whether the next completed row still belongs to the header region.
    pub fn in_header(&self) -> bool {
        self.header_rows_seen < self.header_rows
    }

    /// Running mean of `channel`; `0` before the first sample.
    pub fn mean(&self, channel: Channel) -> f64 {
        self.means[channel.index()]
    }

    /// Timestamp of the most recent completed sample row.
    pub fn last_timestamp(&self) -> Option<f64> {
        self.last_timestamp
    }

    /// Stage a field value for the row in progress.
    ///
    /// Ignored while in the header region, and for channels this stream does not
    /// average (other than its timestamp).
    pub fn stage(&mut self, sample: ChannelSample) {
        if self.in_header() {
            return;
        }
        if sample.channel == Channel::Timestamp {
            self.staged_timestamp = Some(sample.value);
        } else if self.kind.averaged_channels().contains(&sample.channel) {
            self.staged[sample.channel.index()] = Some(sample.value);
        }
    }

    /// Fold `value` into the mean of `channel` as sample `sample_count + 1`.
    ///
    /// This is the row-in-progress sample index; it only advances in
    /// [`Self::complete_row`].
    pub fn update(&mut self, channel: Channel, value: f64) {
        let n = (self.sample_count + 1) as f64;
        let mean = &mut self.means[channel.index()];
        *mean += (value - *mean) / n;
    }

    /// Terminate the row in progress.
    pub fn complete_row(&mut self) -> RowDisposition {
        if self.in_header() {
            self.header_rows_seen += 1;
            self.clear_staged();
            return RowDisposition::Header;
        }

        for &channel in self.kind.averaged_channels() {
            let value = self.staged[channel.index()].unwrap_or(0.0);
            self.update(channel, value);
        }
        if let Some(ts) = self.staged_timestamp {
            self.last_timestamp = Some(ts);
        }
        self.clear_staged();
        self.sample_count += 1;
        RowDisposition::Sample(self.sample_count)
    }

    /// Zero all means and the sample count. Header progress is kept.
    pub fn reset(&mut self) {
        self.sample_count = 0;
        self.means = [0.0; Channel::COUNT];
        self.last_timestamp = None;
        self.clear_staged();
    }

    /// A new producer connection re-sends its header. Means and count are kept.
    pub fn restart_header(&mut self) {
        self.header_rows_seen = 0;
        self.clear_staged();
    }

    fn clear_staged(&mut self) {
        self.staged = [None; Channel::COUNT];
        self.staged_timestamp = None;
    }
}
