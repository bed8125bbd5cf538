//! RC error diagnostic reports.
//!
//! Reports are kept in the `RcDiagReport` ring buffer, indexed by a wrapping
//! 16-bit counter. A logical report may span several records, bracketed by
//! the [`RcDiagFlags::FIRST`] and [`RcDiagFlags::LAST`] flags, and each record
//! carries the owner and process it may be handed to.

use crate::error::{JournalError, Result};
use crate::record::{
    CommonRecord, RC_DIAG_MAX_ENTRIES, RC_DIAG_OVERFLOW_TAG, RcDiagEntry, RcDiagRecord,
};
use crate::ring::RingBufferCollection;
use bitflags::bitflags;
use rcdb_common::RecordType;
use tracing::warn;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct RcDiagFlags: u32 {
        /// First record of a report
        const FIRST = 1 << 0;
        /// Last record of a report
        const LAST = 1 << 1;
    }
}

/// Owner side of a record filter.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OwnerFilter {
    /// Kernel-side reader; sees every owner.
    Default,
    Any,
    Owner(u32),
}

impl OwnerFilter {
    fn matches(self, owner: u32) -> bool {
        match self {
            OwnerFilter::Default | OwnerFilter::Any => true,
            OwnerFilter::Owner(wanted) => wanted == owner,
        }
    }
}

/// Process side of a record filter.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProcessFilter {
    Any,
    Process(u32),
}

impl ProcessFilter {
    fn matches(self, process_id: u32) -> bool {
        match self {
            ProcessFilter::Any => true,
            ProcessFilter::Process(wanted) => wanted == process_id,
        }
    }
}

/// One diagnostic report to store.
#[derive(Debug, Clone, Copy)]
pub struct RcDiagReport<'a> {
    pub owner: u32,
    pub process_id: u32,
    pub record_type: u32,
    pub flags: RcDiagFlags,
    pub entries: &'a [RcDiagEntry],
}

#[derive(Debug, Default)]
pub struct RcDiagLog {
    next_idx: u16,
    /// Set once more reports were written than the ring can hold.
    records_dropped: bool,
}

impl RcDiagLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_idx(&self) -> u16 {
        self.next_idx
    }

    pub fn records_dropped(&self) -> bool {
        self.records_dropped
    }

    /// Stores `report` and returns the index it was given.
    ///
    /// Reports with more entries than a record holds keep the leading
    /// entries; the last slot is replaced by an overflow marker whose value
    /// is the number of entries it stands for.
    pub fn add(
        &mut self,
        rings: &mut RingBufferCollection,
        common: &CommonRecord,
        report: &RcDiagReport<'_>,
    ) -> Result<u16> {
        let idx = self.next_idx;
        let record = rings.append::<RcDiagRecord>(common)?;

        record.idx = idx;
        record.flags = report.flags.bits();
        record.owner = report.owner;
        record.process_id = report.process_id;
        record.record_type = report.record_type;

        let len = report.entries.len();
        if len > RC_DIAG_MAX_ENTRIES {
            warn!(
                entries = len,
                capacity = RC_DIAG_MAX_ENTRIES,
                "RC diagnostic report too large, truncating"
            );
            let kept = RC_DIAG_MAX_ENTRIES - 1;
            record.data[..kept].copy_from_slice(&report.entries[..kept]);
            record.data[kept] = RcDiagEntry {
                offset: 0,
                tag: RC_DIAG_OVERFLOW_TAG,
                value: (len - kept) as u64,
            };
            record.count = RC_DIAG_MAX_ENTRIES as u32;
        } else {
            record.data[..len].copy_from_slice(report.entries);
            record.count = len as u32;
        }

        self.next_idx = idx.wrapping_add(1);
        let capacity = rings
            .find(RecordType::RcDiagReport)
            .map_or(0, |ring| ring.max_entries());
        self.records_dropped |= self.next_idx as usize >= capacity;

        Ok(idx)
    }

    /// Record `idx`, if it is still in the ring and passes the filter.
    ///
    /// `Any` owner together with `Any` process is refused.
    pub fn get<'r>(
        &self,
        rings: &'r mut RingBufferCollection,
        idx: u16,
        owner: OwnerFilter,
        process: ProcessFilter,
    ) -> Result<&'r mut RcDiagRecord> {
        let record_type = RecordType::RcDiagReport;
        let ring = rings
            .find_mut(record_type)
            .ok_or(JournalError::NoRingBuffer { record_type })?;

        let num = ring.num_entries();
        let offset = self.next_idx.wrapping_sub(idx) as usize;
        if offset == 0 || offset > num {
            return Err(JournalError::NotFound { id: idx.into() });
        }

        let record = ring
            .get_mut::<RcDiagRecord>(num - offset)
            .ok_or(JournalError::Layout { record_type })?;
        if record.idx != idx {
            return Err(JournalError::NotFound { id: idx.into() });
        }

        if !owner.matches(record.owner) || !process.matches(record.process_id) {
            return Err(JournalError::InsufficientPermissions);
        }
        if owner == OwnerFilter::Any && process == ProcessFilter::Any {
            return Err(JournalError::InsufficientPermissions);
        }

        Ok(record)
    }

    /// First and last index of the complete reports visible through the
    /// filter.
    ///
    /// The range starts at the oldest qualifying record flagged `FIRST`, so a
    /// report whose head was overwritten is left out, and ends at the newest
    /// qualifying record flagged `LAST` from there on.
    pub fn range(
        &self,
        rings: &RingBufferCollection,
        owner: OwnerFilter,
        process: ProcessFilter,
    ) -> Result<(u16, u16)> {
        let record_type = RecordType::RcDiagReport;
        let ring = rings
            .find(record_type)
            .ok_or(JournalError::NoRingBuffer { record_type })?;

        let mut start = None;
        let mut end = None;
        for logical in 0..ring.num_entries() {
            let Some(record) = ring.get::<RcDiagRecord>(logical) else {
                continue;
            };
            if !owner.matches(record.owner) || !process.matches(record.process_id) {
                continue;
            }

            let flags = RcDiagFlags::from_bits_retain(record.flags);
            if start.is_none() && flags.contains(RcDiagFlags::FIRST) {
                start = Some(record.idx);
            }
            if start.is_some() && flags.contains(RcDiagFlags::LAST) {
                end = Some(record.idx);
            }
        }

        match (start, end) {
            (Some(start), Some(end)) => Ok((start, end)),
            _ => Err(JournalError::NotFound {
                id: self.next_idx.into(),
            }),
        }
    }

    /// Hands every record from `start` to `end` (inclusive, wrapping) to
    /// `owner` and `process_id`.
    ///
    /// Records that cannot be found are skipped; the last such failure is
    /// returned once the whole range was visited.
    pub fn update_context(
        &self,
        rings: &mut RingBufferCollection,
        start: u16,
        end: u16,
        process_id: u32,
        owner: u32,
    ) -> Result<()> {
        let mut status = Ok(());
        let stop = end.wrapping_add(1);
        let mut idx = start;
        while idx != stop {
            match self.get(rings, idx, OwnerFilter::Default, ProcessFilter::Any) {
                Ok(record) => {
                    record.owner = owner;
                    record.process_id = process_id;
                }
                Err(err) => status = Err(err),
            }
            idx = idx.wrapping_add(1);
        }
        status
    }
}
