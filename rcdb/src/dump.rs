//! Time-ordered dump of everything the journal holds.
//!
//! [`OrderedView`] borrows every ring buffer slot, every full device dump and
//! every top-level arena record and sorts them by timestamp. Ties keep their
//! insertion order: ring buffers first, then full dumps, then the arena.
//! The view is then streamed through a [`RecordEncoder`].

use crate::arena::Arena;
use crate::error::{JournalError, Result};
use crate::record::{CommonRecord, Record};
use crate::ring::RingBufferCollection;
use rcdb_common::RecordType;
use serde::Serialize;
use std::convert::Infallible;
use zerocopy::FromBytes;

/// Container a record was found in.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordSource {
    Ring,
    FullDump,
    Arena,
}

/// A record borrowed from the journal for the duration of a dump.
#[derive(Debug, Copy, Clone)]
pub struct RecordView<'a> {
    pub source: RecordSource,
    pub common: &'a CommonRecord,
    /// Record bytes as stored; the payload for full dumps.
    pub bytes: &'a [u8],
}

impl<'a> RecordView<'a> {
    pub fn record_type(&self) -> Option<RecordType> {
        self.common.record_type()
    }

    pub fn timestamp(&self) -> u64 {
        self.common.timestamp
    }

    /// Typed view of the record, if it has the layout of `R`.
    pub fn as_record<R: Record>(&self) -> Option<&'a R> {
        if self.source == RecordSource::FullDump || self.record_type() != Some(R::TYPE) {
            return None;
        }
        R::ref_from_prefix(self.bytes).ok().map(|(record, _)| record)
    }
}

// ── Full dumps ──────────────────────────────────────────────────────────────

/// An out-of-band device dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullDump {
    pub common: CommonRecord,
    pub payload: Vec<u8>,
}

/// Full device dumps taken since the last clear.
#[derive(Debug, Default)]
pub struct ErrorHistory {
    dumps: Vec<FullDump>,
    /// Dumps ever pushed, including cleared ones.
    error_count: u32,
}

impl ErrorHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, dump: FullDump) {
        self.dumps.push(dump);
        self.error_count = self.error_count.wrapping_add(1);
    }

    pub fn dumps(&self) -> &[FullDump] {
        &self.dumps
    }

    /// Drops every dump and returns how many there were.
    pub fn clear(&mut self) -> usize {
        let n = self.dumps.len();
        self.dumps.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.dumps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dumps.is_empty()
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }
}

// ── Ordered view ────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct OrderedView<'a> {
    records: Vec<RecordView<'a>>,
}

impl<'a> OrderedView<'a> {
    pub fn build(
        rings: &'a RingBufferCollection,
        history: &'a ErrorHistory,
        arena: &'a Arena,
    ) -> Self {
        let mut records = Vec::new();

        for ring in rings.iter() {
            for slot in ring.iter() {
                if let Ok((common, _)) = CommonRecord::ref_from_prefix(slot) {
                    records.push(RecordView {
                        source: RecordSource::Ring,
                        common,
                        bytes: slot,
                    });
                }
            }
        }

        records.extend(history.dumps().iter().map(|dump| RecordView {
            source: RecordSource::FullDump,
            common: &dump.common,
            bytes: &dump.payload,
        }));

        records.extend(arena.records().map(|record| RecordView {
            source: RecordSource::Arena,
            common: record.common,
            bytes: record.bytes,
        }));

        // Stable, so equal timestamps keep insertion order.
        records.sort_by_key(|record| record.timestamp());

        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RecordView<'a>> {
        self.records.iter()
    }

    pub fn timestamps(&self) -> Vec<u64> {
        self.records.iter().map(|record| record.timestamp()).collect()
    }

    /// Streams the view through `encoder` and returns the number of records
    /// written.
    pub fn write_to<E: RecordEncoder>(&self, header: &DumpHeader, encoder: &mut E) -> Result<usize> {
        encoder.begin(header).map_err(encoder_error)?;
        for record in &self.records {
            encoder.encode(record).map_err(encoder_error)?;
        }
        encoder.finish().map_err(encoder_error)?;
        Ok(self.records.len())
    }
}

impl<'v, 'a> IntoIterator for &'v OrderedView<'a> {
    type Item = &'v RecordView<'a>;
    type IntoIter = std::slice::Iter<'v, RecordView<'a>>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

fn encoder_error<E: std::error::Error + Send + Sync + 'static>(err: E) -> JournalError {
    JournalError::Encoder(Box::new(err))
}

// ── Encoding ────────────────────────────────────────────────────────────────

/// Handed to the encoder before the first record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct DumpHeader {
    /// Driver load address assert offsets are relative to
    pub load_address: u64,
    /// Ticks per second of record timestamps
    pub timestamp_frequency: u64,
    /// Unix time in microseconds at tick zero
    pub system_time_reference: u64,
    pub record_count: u32,
}

/// Consumer of an ordered dump.
pub trait RecordEncoder {
    type Error: std::error::Error + Send + Sync + 'static;

    fn begin(&mut self, header: &DumpHeader) -> std::result::Result<(), Self::Error>;

    fn encode(&mut self, record: &RecordView<'_>) -> std::result::Result<(), Self::Error>;

    fn finish(&mut self) -> std::result::Result<(), Self::Error> {
        Ok(())
    }
}

/// Summary of one encoded record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EncodedRecord {
    pub source: RecordSource,
    pub record_type: Option<RecordType>,
    pub timestamp: u64,
    pub device_tag: u32,
    pub len: usize,
}

/// Encoder that keeps a summary of every record it sees.
#[derive(Debug, Default, Clone, Serialize)]
pub struct RecordingEncoder {
    pub header: Option<DumpHeader>,
    pub records: Vec<EncodedRecord>,
    pub finished: bool,
}

impl RecordingEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timestamps(&self) -> Vec<u64> {
        self.records.iter().map(|record| record.timestamp).collect()
    }
}

impl RecordEncoder for RecordingEncoder {
    type Error = Infallible;

    fn begin(&mut self, header: &DumpHeader) -> std::result::Result<(), Infallible> {
        self.header = Some(*header);
        self.records.clear();
        self.finished = false;
        Ok(())
    }

    fn encode(&mut self, record: &RecordView<'_>) -> std::result::Result<(), Infallible> {
        self.records.push(EncodedRecord {
            source: record.source,
            record_type: record.record_type(),
            timestamp: record.timestamp(),
            device_tag: record.common.device_tag,
            len: record.bytes.len(),
        });
        Ok(())
    }

    fn finish(&mut self) -> std::result::Result<(), Infallible> {
        self.finished = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{BugcheckRecord, PowerStateRecord};
    use rcdb_common::StateMask;

    fn common(record_type: RecordType, timestamp: u64) -> CommonRecord {
        CommonRecord::new(record_type, 0, timestamp, StateMask::empty())
    }

    fn power_ring(timestamps: &[u64], slots: usize) -> RingBufferCollection {
        let mut rings = RingBufferCollection::new();
        rings.get_or_create(RecordType::PowerState, slots).unwrap();
        for ts in timestamps {
            rings
                .append::<PowerStateRecord>(&common(RecordType::PowerState, *ts))
                .unwrap();
        }
        rings
    }

    fn bugcheck(arena: &mut Arena, timestamp: u64) {
        let record = BugcheckRecord {
            common: common(RecordType::BugCheck, timestamp),
            bugcheck_code: 1,
            _reserved: 0,
        };
        arena.allocate_record(RecordType::BugCheck, &record).unwrap();
    }

    #[test]
    fn wrapped_ring_keeps_newest() {
        let rings = power_ring(&[10, 20, 30, 40], 3);
        let history = ErrorHistory::new();
        let arena = Arena::new(0);

        let view = OrderedView::build(&rings, &history, &arena);
        assert_eq!(view.timestamps(), [20, 30, 40]);
    }

    #[test]
    fn merges_by_timestamp_with_stable_ties() {
        let rings = power_ring(&[5, 15], 4);
        let mut history = ErrorHistory::new();
        history.push(FullDump {
            common: common(RecordType::FullDump, 15),
            payload: vec![1, 2, 3],
        });
        let mut arena = Arena::new(256);
        bugcheck(&mut arena, 1);
        bugcheck(&mut arena, 15);

        let view = OrderedView::build(&rings, &history, &arena);
        let order: Vec<_> = view.iter().map(|r| (r.timestamp(), r.source)).collect();
        assert_eq!(
            order,
            [
                (1, RecordSource::Arena),
                (5, RecordSource::Ring),
                (15, RecordSource::Ring),
                (15, RecordSource::FullDump),
                (15, RecordSource::Arena),
            ]
        );
    }

    #[test]
    fn typed_views() {
        let rings = power_ring(&[1], 2);
        let history = ErrorHistory::new();
        let mut arena = Arena::new(128);
        bugcheck(&mut arena, 2);

        let view = OrderedView::build(&rings, &history, &arena);
        let records: Vec<_> = view.iter().collect();
        assert!(records[0].as_record::<PowerStateRecord>().is_some());
        assert!(records[0].as_record::<BugcheckRecord>().is_none());
        assert_eq!(records[1].as_record::<BugcheckRecord>().unwrap().bugcheck_code, 1);
    }

    #[test]
    fn recording_encoder() {
        let rings = power_ring(&[3, 1], 2);
        let history = ErrorHistory::new();
        let arena = Arena::new(0);
        let view = OrderedView::build(&rings, &history, &arena);

        let header = DumpHeader {
            load_address: 0x1000,
            timestamp_frequency: 1_000_000_000,
            system_time_reference: 0,
            record_count: view.len() as u32,
        };
        let mut encoder = RecordingEncoder::new();
        assert_eq!(view.write_to(&header, &mut encoder).unwrap(), 2);
        assert_eq!(encoder.header, Some(header));
        assert_eq!(encoder.timestamps(), [1, 3]);
        assert!(encoder.finished);
        assert_eq!(encoder.records[0].record_type, Some(RecordType::PowerState));
    }

    #[test]
    fn history_counts_across_clears() {
        let mut history = ErrorHistory::new();
        for ts in 0..3 {
            history.push(FullDump {
                common: common(RecordType::FullDump, ts),
                payload: Vec::new(),
            });
        }
        assert_eq!(history.clear(), 3);
        assert!(history.is_empty());
        assert_eq!(history.error_count(), 3);
    }
}
