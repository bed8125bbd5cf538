//! NOCAT telemetry journal.
//!
//! NOCAT entries live in the `NocatReport` ring buffer and carry ids that
//! increase by one per stored entry. A reporter drains them in id order
//! through [`NocatJournal::report_next`]; entries overwritten before the
//! reporter reaches them are counted as dropped.
//!
//! Bugcheck and TDR entries lock the journal at their timestamp. While it is
//! locked, other entries are only admitted if they predate the lock, so the
//! history leading up to the failure cannot be pushed out of the ring before
//! it is reported. The lock clears once the reporter has caught up.

mod counters;
mod params;

pub use counters::{CounterSnapshot, EventCounters, NocatCounter};
pub use params::{NocatParams, NocatReport};

use crate::collab::{DeviceContext, DeviceProbe};
use crate::error::{JournalError, Result};
use crate::record::{
    AssertDiag, CALL_STACK_DEPTH, CommonRecord, NOCAT_DIAG_BUFFER_LEN, NocatDeviceState,
    NocatRecord, write_cstr,
};
use crate::ring::RingBufferCollection;
use rcdb_common::{NocatRecordType, RecordType, StateMask, TdrReason};
use std::ops::Deref;
use tracing::{debug, warn};
use zerocopy::{FromBytes, IntoBytes};

/// Call stack of an ASSERT entry, relative to the driver load address.
pub type AssertStack = [u32; CALL_STACK_DEPTH];

/// Id bookkeeping and lock state of the NOCAT journal.
#[derive(Debug, Default)]
pub struct NocatJournal {
    next_record_id: u32,
    next_reported_id: u32,
    /// Zero when unlocked.
    lock_timestamp: u64,
    last_record_id: [Option<u32>; NocatRecordType::SLOTS],
    last_assert_stack: Option<AssertStack>,
}

impl NocatJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_record_id(&self) -> u32 {
        self.next_record_id
    }

    pub fn next_reported_id(&self) -> u32 {
        self.next_reported_id
    }

    pub fn lock_timestamp(&self) -> Option<u64> {
        (self.lock_timestamp != 0).then_some(self.lock_timestamp)
    }

    pub fn is_locked(&self) -> bool {
        self.lock_timestamp != 0
    }

    /// Entries stored but not yet reported, including ones already
    /// overwritten in the ring.
    pub fn outstanding(&self) -> u32 {
        self.next_record_id.wrapping_sub(self.next_reported_id)
    }

    /// Id of the newest entry of `record_type`; `Unknown` means any type.
    pub fn last_record_id(&self, record_type: NocatRecordType) -> Option<u32> {
        self.last_record_id[Self::slot(record_type)]
    }

    fn slot(record_type: NocatRecordType) -> usize {
        match record_type {
            NocatRecordType::Unknown => NocatRecordType::ANY_SLOT,
            other => other.slot(),
        }
    }

    /// Applies the lock window to an entry about to be inserted and returns
    /// whether it may be stored.
    pub fn admit(
        &mut self,
        record_type: NocatRecordType,
        timestamp: u64,
        counters: &EventCounters,
    ) -> bool {
        if record_type.is_priority() {
            if self.lock_timestamp == 0 {
                counters.incr(NocatCounter::JournalLocked);
                self.lock_timestamp = timestamp.max(1);
            } else {
                counters.incr(NocatCounter::JournalLockUpdated);
                if timestamp > self.lock_timestamp {
                    self.lock_timestamp = timestamp;
                }
            }
            return true;
        }

        if self.lock_timestamp == 0 {
            return true;
        }
        if (timestamp.wrapping_sub(self.lock_timestamp) as i64) < 0 {
            counters.incr(NocatCounter::Grandfathered);
            true
        } else {
            counters.incr(NocatCounter::CollectLockedOut);
            false
        }
    }

    /// Writes a new entry into the NOCAT ring and returns its id.
    ///
    /// A `device` is probed for reachability when the entry type asks for
    /// it; an unreachable device has its video memory marked failed.
    pub fn store(
        &mut self,
        rings: &mut RingBufferCollection,
        counters: &EventCounters,
        params: &NocatParams<'_>,
        device: Option<&DeviceContext>,
        probe: &dyn DeviceProbe,
        timestamp: u64,
    ) -> Result<u32> {
        let mut state = device.map_or(StateMask::empty(), |device| device.state);
        if let Some(device) = device {
            if params.record_type.probes_device() && !probe.is_device_reachable(device.tag) {
                state |= StateMask::VIDMEM_FAILED;
            }
        }

        let common = CommonRecord::new(
            RecordType::NocatReport,
            device.map_or(0, |device| device.tag),
            timestamp,
            state,
        );
        let record = match rings.append::<NocatRecord>(&common) {
            Ok(record) => record,
            Err(err) => {
                counters.incr(NocatCounter::AllocFailed);
                counters.incr(NocatCounter::CollectFailed);
                warn!(
                    record_type = ?params.record_type,
                    error = %err,
                    "failed to allocate NOCAT entry"
                );
                return Err(err);
            }
        };

        let id = self.next_record_id;
        self.next_record_id = id.wrapping_add(1);
        counters.incr(NocatCounter::Allocated);

        record.id = id;
        record.in_use = 0;
        record.record_type = params.record_type as u32;
        record.bugcheck = params.bugcheck;
        record.subsystem = params.subsystem;
        record.error_code = params.error_code;

        if let Some(device) = device {
            record.device_state = NocatDeviceState {
                valid: 1,
                tag: device.tag,
                device_id: device.identity.device_id,
                vendor_id: device.identity.vendor_id,
                subsystem_vendor_id: device.identity.subsystem_vendor_id,
                subsystem_id: device.identity.subsystem_id,
                revision: device.identity.revision,
                _reserved: 0,
                state_mask: state.bits(),
            };
        }

        let source = params
            .source
            .or(params.record_type.default_source())
            .unwrap_or("Unknown");
        write_cstr(&mut record.source, source);

        let diag_len = params.diag.len().min(NOCAT_DIAG_BUFFER_LEN);
        if diag_len < params.diag.len() {
            counters.incr(NocatCounter::DiagTruncated);
            debug!(
                len = params.diag.len(),
                capacity = NOCAT_DIAG_BUFFER_LEN,
                "truncated NOCAT diagnostic buffer"
            );
        }
        record.diag_buffer[..diag_len].copy_from_slice(&params.diag[..diag_len]);
        record.diag_len = diag_len as u32;

        write_cstr(
            &mut record.faulting_engine,
            params.faulting_engine.unwrap_or("Unknown"),
        );
        write_cstr(&mut record.tdr_reason, TdrReason::describe(params.tdr_reason));

        counters.incr(NocatCounter::Collected);
        self.last_record_id[params.record_type.slot()] = Some(id);
        self.last_record_id[NocatRecordType::ANY_SLOT] = Some(id);

        Ok(id)
    }

    /// Looks up the entry with `id`.
    ///
    /// Without `exact`, an id older than every live entry resolves to the
    /// oldest live entry. Ids that were never assigned are not substituted.
    pub fn get_by_id<'r>(
        &self,
        rings: &'r mut RingBufferCollection,
        counters: &EventCounters,
        id: u32,
        exact: bool,
    ) -> Result<NocatEntryRef<'r>> {
        let record_type = RecordType::NocatReport;
        let ring = rings
            .find_mut(record_type)
            .ok_or(JournalError::NoRingBuffer { record_type })?;

        let num = ring.num_entries() as u32;
        if num == 0 {
            counters.incr(NocatCounter::NoRecords);
            return Err(JournalError::NotFound { id });
        }

        let offset = self.next_record_id.wrapping_sub(id);
        let in_window = (1..=num).contains(&offset);
        let logical = if in_window {
            counters.incr(NocatCounter::MatchFound);
            num - offset
        } else if !exact && offset > num && offset <= i32::MAX as u32 {
            counters.incr(NocatCounter::ClosestFound);
            0
        } else {
            counters.incr(NocatCounter::NoMatch);
            return Err(JournalError::NotFound { id });
        };

        let record = ring
            .get_mut::<NocatRecord>(logical as usize)
            .ok_or(JournalError::Layout { record_type })?;
        if in_window && record.id != id {
            counters.incr(NocatCounter::NoMatch);
            return Err(JournalError::NotFound { id });
        }

        Ok(NocatEntryRef::acquire(record))
    }

    /// Newest entry of `record_type`; `Unknown` means any type.
    pub fn newest_of_type<'r>(
        &self,
        rings: &'r mut RingBufferCollection,
        counters: &EventCounters,
        record_type: NocatRecordType,
    ) -> Result<NocatEntryRef<'r>> {
        let id = self
            .last_record_id(record_type)
            .ok_or(JournalError::NotFound {
                id: self.next_record_id,
            })?;
        self.get_by_id(rings, counters, id, true)
    }

    /// Hands out the next unreported entry and moves the report cursor past
    /// it.
    ///
    /// Entries lost to wraparound are skipped and added to the dropped count.
    /// Once nothing is outstanding the lock, if any, is released.
    pub fn report_next<'r>(
        &mut self,
        rings: &'r mut RingBufferCollection,
        counters: &EventCounters,
    ) -> Result<NocatEntryRef<'r>> {
        counters.incr(NocatCounter::Requested);

        let result = if self.outstanding() == 0 {
            counters.incr(NocatCounter::NoRecords);
            Err(JournalError::NotFound {
                id: self.next_reported_id,
            })
        } else {
            self.get_by_id(rings, counters, self.next_reported_id, false)
                .inspect(|entry| {
                    let found = entry.id();
                    let dropped = found.wrapping_sub(self.next_reported_id);
                    if dropped > 0 {
                        counters.add(NocatCounter::Dropped, dropped);
                    }
                    counters.incr(NocatCounter::Reported);
                })
        };

        if let Ok(entry) = &result {
            self.next_reported_id = entry.id().wrapping_add(1);
        }

        if self.lock_timestamp != 0 && self.outstanding() == 0 {
            counters.incr(NocatCounter::JournalUnlocked);
            self.lock_timestamp = 0;
        }

        result
    }

    /// Folds an assertion into the newest entry if that entry is the same
    /// assertion. Returns whether it was folded.
    pub fn fold_repeated_assert(
        &self,
        rings: &mut RingBufferCollection,
        counters: &EventCounters,
        stack: &AssertStack,
    ) -> bool {
        let last_assert = self.last_record_id(NocatRecordType::Assert);
        let last_any = self.last_record_id(NocatRecordType::Unknown);
        if last_assert.is_none() || last_assert != last_any {
            return false;
        }
        if self.last_assert_stack.as_ref() != Some(stack) {
            return false;
        }

        let Ok(mut entry) = self.newest_of_type(rings, counters, NocatRecordType::Unknown) else {
            return false;
        };
        let record = entry.record_mut();
        if record.record_type != NocatRecordType::Assert as u32 {
            return false;
        }

        let Ok((mut diag, _)) = AssertDiag::read_from_prefix(&record.diag_buffer[..]) else {
            return false;
        };
        diag.count = diag.count.saturating_add(1);
        diag.write_to_prefix(&mut record.diag_buffer[..]).is_ok()
    }

    /// Remembers the stack of the assertion being inserted, for
    /// [`Self::fold_repeated_assert`].
    pub fn remember_assert(&mut self, stack: &AssertStack) {
        self.last_assert_stack = Some(*stack);
    }
}

/// A borrowed NOCAT entry.
///
/// The entry's in-use count is raised while the reference is alive.
pub struct NocatEntryRef<'a> {
    record: &'a mut NocatRecord,
}

impl<'a> NocatEntryRef<'a> {
    fn acquire(record: &'a mut NocatRecord) -> Self {
        record.in_use += 1;
        Self { record }
    }

    pub fn id(&self) -> u32 {
        self.record.id
    }

    pub fn record(&self) -> &NocatRecord {
        &*self.record
    }

    pub fn record_mut(&mut self) -> &mut NocatRecord {
        &mut *self.record
    }

    pub fn to_report(&self, load_address: u64) -> NocatReport {
        NocatReport::from_record(&*self.record, load_address)
    }
}

impl Deref for NocatEntryRef<'_> {
    type Target = NocatRecord;

    fn deref(&self) -> &NocatRecord {
        &*self.record
    }
}

impl Drop for NocatEntryRef<'_> {
    fn drop(&mut self) {
        self.record.in_use -= 1;
    }
}

impl std::fmt::Debug for NocatEntryRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NocatEntryRef")
            .field("id", &self.record.id)
            .field("in_use", &self.record.in_use)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{AssumeReachable, DeviceIdentity};
    use crate::record::read_cstr;

    struct Unreachable;

    impl DeviceProbe for Unreachable {
        fn is_device_reachable(&self, _device_tag: u32) -> bool {
            false
        }
    }

    struct Fixture {
        nocat: NocatJournal,
        rings: RingBufferCollection,
        counters: EventCounters,
    }

    impl Fixture {
        fn new(entries: usize) -> Self {
            let mut rings = RingBufferCollection::new();
            rings.get_or_create(RecordType::NocatReport, entries).unwrap();
            Self {
                nocat: NocatJournal::new(),
                rings,
                counters: EventCounters::new(),
            }
        }

        fn insert(&mut self, record_type: NocatRecordType, timestamp: u64) -> Option<u32> {
            let params = NocatParams::new(record_type).with_timestamp(timestamp);
            if !self.nocat.admit(record_type, timestamp, &self.counters) {
                return None;
            }
            self.nocat
                .store(&mut self.rings, &self.counters, &params, None, &AssumeReachable, timestamp)
                .ok()
        }

        fn report(&mut self) -> Option<u32> {
            self.nocat
                .report_next(&mut self.rings, &self.counters)
                .ok()
                .map(|entry| entry.id())
        }

        fn count(&self, counter: NocatCounter) -> u32 {
            self.counters.get(counter)
        }
    }

    #[test]
    fn ids_are_sequential() {
        let mut f = Fixture::new(4);
        for expected in 0..3 {
            assert_eq!(f.insert(NocatRecordType::Engine, 10), Some(expected));
        }
        assert_eq!(f.nocat.outstanding(), 3);
        assert_eq!(f.nocat.last_record_id(NocatRecordType::Engine), Some(2));
        assert_eq!(f.nocat.last_record_id(NocatRecordType::Unknown), Some(2));
        assert_eq!(f.nocat.last_record_id(NocatRecordType::Rc), None);
        assert_eq!(f.count(NocatCounter::Allocated), 3);
        assert_eq!(f.count(NocatCounter::Collected), 3);
    }

    #[test]
    fn stored_fields() {
        let mut f = Fixture::new(4);
        let device = DeviceContext::new(7)
            .with_state(StateMask::IN_STANDBY)
            .with_identity(DeviceIdentity {
                device_id: 0x2684,
                vendor_id: 0x10de,
                ..DeviceIdentity::default()
            });
        let diag = [0xAB; 8];
        let params = NocatParams::new(NocatRecordType::Tdr)
            .with_subsystem(3)
            .with_error_code(0x1234)
            .with_tdr_reason(TdrReason::BusReset as u32)
            .with_diag(&diag);

        let id = f
            .nocat
            .store(&mut f.rings, &f.counters, &params, Some(&device), &AssumeReachable, 50)
            .unwrap();

        let entry = f.nocat.get_by_id(&mut f.rings, &f.counters, id, true).unwrap();
        assert_eq!(entry.common.timestamp, 50);
        assert_eq!(entry.common.device_tag, 7);
        assert_eq!(entry.subsystem, 3);
        assert_eq!(entry.error_code, 0x1234);
        assert_eq!(entry.diag(), &diag);
        assert_eq!(read_cstr(&entry.source), "Unknown");
        assert_eq!(read_cstr(&entry.faulting_engine), "Unknown");
        assert_eq!(read_cstr(&entry.tdr_reason), "BUSRESET");
        assert_eq!(entry.device_state.valid, 1);
        assert_eq!(entry.device_state.vendor_id, 0x10de);
        assert_eq!(entry.device_state.state_mask, StateMask::IN_STANDBY.bits());
    }

    #[test]
    fn default_sources() {
        let mut f = Fixture::new(4);
        let rc = f.insert(NocatRecordType::Rc, 1).unwrap();
        let assert = f.insert(NocatRecordType::Assert, 2).unwrap();

        let entry = f.nocat.get_by_id(&mut f.rings, &f.counters, rc, true).unwrap();
        assert_eq!(read_cstr(&entry.source), "RC Error");
        drop(entry);
        let entry = f.nocat.get_by_id(&mut f.rings, &f.counters, assert, true).unwrap();
        assert_eq!(read_cstr(&entry.source), "ASSERT");
    }

    #[test]
    fn unreachable_device_marks_vidmem_failed() {
        let mut f = Fixture::new(4);
        let device = DeviceContext::new(1);

        let rc = NocatParams::new(NocatRecordType::Rc);
        let id = f
            .nocat
            .store(&mut f.rings, &f.counters, &rc, Some(&device), &Unreachable, 1)
            .unwrap();
        let entry = f.nocat.get_by_id(&mut f.rings, &f.counters, id, true).unwrap();
        assert!(entry.common.state().contains(StateMask::VIDMEM_FAILED));
        drop(entry);

        // Engine entries never probe.
        let engine = NocatParams::new(NocatRecordType::Engine);
        let id = f
            .nocat
            .store(&mut f.rings, &f.counters, &engine, Some(&device), &Unreachable, 2)
            .unwrap();
        let entry = f.nocat.get_by_id(&mut f.rings, &f.counters, id, true).unwrap();
        assert!(entry.common.state().is_empty());
    }

    #[test]
    fn diag_is_truncated() {
        let mut f = Fixture::new(2);
        let diag = vec![7u8; NOCAT_DIAG_BUFFER_LEN + 100];
        let params = NocatParams::new(NocatRecordType::Engine).with_diag(&diag);

        let id = f
            .nocat
            .store(&mut f.rings, &f.counters, &params, None, &AssumeReachable, 1)
            .unwrap();
        let entry = f.nocat.get_by_id(&mut f.rings, &f.counters, id, true).unwrap();
        assert_eq!(entry.diag_len as usize, NOCAT_DIAG_BUFFER_LEN);
        drop(entry);
        assert_eq!(f.count(NocatCounter::DiagTruncated), 1);
    }

    #[test]
    fn missing_ring_counts_failure() {
        let mut f = Fixture::new(2);
        f.rings.destroy(RecordType::NocatReport).unwrap();

        assert_eq!(f.insert(NocatRecordType::Engine, 1), None);
        assert_eq!(f.count(NocatCounter::AllocFailed), 1);
        assert_eq!(f.count(NocatCounter::CollectFailed), 1);
        assert_eq!(f.nocat.next_record_id(), 0);
    }

    #[test]
    fn entry_ref_tracks_in_use() {
        let mut f = Fixture::new(2);
        let id = f.insert(NocatRecordType::Engine, 1).unwrap();

        let entry = f.nocat.get_by_id(&mut f.rings, &f.counters, id, true).unwrap();
        assert_eq!(entry.in_use, 1);
        drop(entry);

        let ring = f.rings.find(RecordType::NocatReport).unwrap();
        assert_eq!(ring.get::<NocatRecord>(0).unwrap().in_use, 0);
    }

    #[test]
    fn lookup_window() {
        let mut f = Fixture::new(3);
        for ts in 0..5 {
            f.insert(NocatRecordType::Engine, ts);
        }
        // Live ids: 2, 3, 4.
        let nocat = &f.nocat;
        let rings = &mut f.rings;
        let counters = &f.counters;

        assert_eq!(nocat.get_by_id(rings, counters, 3, true).unwrap().id(), 3);
        assert!(nocat.get_by_id(rings, counters, 1, true).is_err());
        assert_eq!(nocat.get_by_id(rings, counters, 1, false).unwrap().id(), 2);
        assert!(nocat.get_by_id(rings, counters, 5, false).is_err());
        assert!(nocat.get_by_id(rings, counters, 900, false).is_err());

        assert_eq!(counters.get(NocatCounter::MatchFound), 1);
        assert_eq!(counters.get(NocatCounter::ClosestFound), 1);
        assert_eq!(counters.get(NocatCounter::NoMatch), 3);
    }

    #[test]
    fn empty_journal_has_no_records() {
        let mut f = Fixture::new(3);
        assert_eq!(f.report(), None);
        assert!(f.nocat.get_by_id(&mut f.rings, &f.counters, 0, false).is_err());
        assert_eq!(f.count(NocatCounter::NoRecords), 2);
        assert_eq!(f.count(NocatCounter::Requested), 1);
    }

    #[test]
    fn report_skips_overwritten_entries() {
        let mut f = Fixture::new(3);
        for ts in 0..5 {
            f.insert(NocatRecordType::Engine, ts);
        }

        assert_eq!(f.report(), Some(2));
        assert_eq!(f.count(NocatCounter::Dropped), 2);
        assert_eq!(f.report(), Some(3));
        assert_eq!(f.report(), Some(4));
        assert_eq!(f.report(), None);
        assert_eq!(f.count(NocatCounter::Reported), 3);
        assert_eq!(f.nocat.outstanding(), 0);
    }

    #[test]
    fn lock_window() {
        let mut f = Fixture::new(16);
        for ts in [10, 20] {
            f.insert(NocatRecordType::Rc, ts).unwrap();
        }

        assert!(f.insert(NocatRecordType::Bugcheck, 100).is_some());
        assert_eq!(f.nocat.lock_timestamp(), Some(100));
        assert_eq!(f.count(NocatCounter::JournalLocked), 1);

        assert!(f.insert(NocatRecordType::Rc, 99).is_some());
        assert!(f.insert(NocatRecordType::Rc, 100).is_none());
        assert!(f.insert(NocatRecordType::Rc, 150).is_none());
        assert_eq!(f.count(NocatCounter::Grandfathered), 1);
        assert_eq!(f.count(NocatCounter::CollectLockedOut), 2);

        // Re-locking only moves forward.
        f.insert(NocatRecordType::Tdr, 80).unwrap();
        assert_eq!(f.nocat.lock_timestamp(), Some(100));
        f.insert(NocatRecordType::Tdr, 200).unwrap();
        assert_eq!(f.nocat.lock_timestamp(), Some(200));
        assert_eq!(f.count(NocatCounter::JournalLockUpdated), 2);

        while f.report().is_some() {}
        assert!(!f.nocat.is_locked());
        assert_eq!(f.count(NocatCounter::JournalUnlocked), 1);
        assert!(f.insert(NocatRecordType::Rc, 300).is_some());
    }

    #[test]
    fn lock_at_time_zero_still_locks() {
        let mut f = Fixture::new(4);
        f.insert(NocatRecordType::Bugcheck, 0).unwrap();
        assert!(f.nocat.is_locked());
        assert!(f.insert(NocatRecordType::Engine, 0).is_some());
        assert!(f.insert(NocatRecordType::Engine, 5).is_none());
    }

    #[test]
    fn repeated_assert_folds_into_newest_entry() {
        let mut f = Fixture::new(4);
        let stack: AssertStack = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10];
        let diag = AssertDiag {
            call_stack: stack,
            count: 1,
        };
        let params = NocatParams::new(NocatRecordType::Assert).with_diag(diag.as_bytes());

        assert!(!f.nocat.fold_repeated_assert(&mut f.rings, &f.counters, &stack));
        f.nocat.remember_assert(&stack);
        let id = f
            .nocat
            .store(&mut f.rings, &f.counters, &params, None, &AssumeReachable, 1)
            .unwrap();

        assert!(f.nocat.fold_repeated_assert(&mut f.rings, &f.counters, &stack));
        assert!(f.nocat.fold_repeated_assert(&mut f.rings, &f.counters, &stack));

        let mut other = stack;
        other[9] = 0;
        assert!(!f.nocat.fold_repeated_assert(&mut f.rings, &f.counters, &other));

        let report = f
            .nocat
            .get_by_id(&mut f.rings, &f.counters, id, true)
            .unwrap()
            .to_report(0);
        assert_eq!(report.assert_diag().unwrap().count, 3);

        // Anything in between breaks the run.
        f.insert(NocatRecordType::Engine, 2).unwrap();
        assert!(!f.nocat.fold_repeated_assert(&mut f.rings, &f.counters, &stack));
    }
}
