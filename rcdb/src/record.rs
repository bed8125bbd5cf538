//! In-memory record layouts.
//!
//! Every record starts with a [`CommonRecord`], which itself starts with a
//! [`RecordHeader`]. Records are `#[repr(C)]`, padding free and sized to a
//! multiple of [`RECORD_ALIGNMENT`], so they can be viewed in place inside the
//! `u64`-backed storage of the arena and the ring buffers.
//!
//! Ring buffer slot sizes are a compile-time function of the record type
//! ([`ring_slot_size`]); arena records carry their size in the header.

use rcdb_common::{RecordGroup, RecordType, StateMask};
use std::sync::atomic::{AtomicU64, Ordering};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

// ── Constants ───────────────────────────────────────────────────────────────

/// Alignment (and size granularity) of every record.
pub const RECORD_ALIGNMENT: usize = 8;

/// Number of return addresses captured with an assertion.
pub const CALL_STACK_DEPTH: usize = 10;

/// Leading call-stack entries that must match for two assertions to fold.
pub const QUALIFYING_STACK_SIZE: usize = 5;

/// Maximum number of entries carried by one RC diagnostic report.
pub const RC_DIAG_MAX_ENTRIES: usize = 32;

/// Capacity of NOCAT string fields, terminator included.
pub const NOCAT_MAX_STR_LEN: usize = 65;

/// Capacity of the TDR reason string, terminator included.
pub const NOCAT_TDR_REASON_LEN: usize = 32;

/// Capacity of the NOCAT diagnostic buffer.
pub const NOCAT_DIAG_BUFFER_LEN: usize = 1024;

/// Tag of the entry that replaces the tail of an oversized RC diagnostic report.
pub const RC_DIAG_OVERFLOW_TAG: u32 = 0xFFFF_FFFF;

pub const fn align_up(size: usize) -> usize {
    (size + RECORD_ALIGNMENT - 1) & !(RECORD_ALIGNMENT - 1)
}

// ── Header and common record ────────────────────────────────────────────────

/// Leading four bytes of every record.
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct RecordHeader {
    pub group: u8,
    pub record_type: u8,
    /// Size of the whole record, header included, in bytes.
    pub size: u16,
}

impl RecordHeader {
    pub fn new(group: RecordGroup, record_type: RecordType, size: u16) -> Self {
        Self {
            group: group as u8,
            record_type: record_type.as_raw(),
            size,
        }
    }

    pub fn group(&self) -> Option<RecordGroup> {
        RecordGroup::from_raw(self.group)
    }

    pub fn record_type(&self) -> Option<RecordType> {
        RecordType::from_raw(self.record_type)
    }

    pub fn size(&self) -> usize {
        self.size as usize
    }
}

/// Fields shared by every record.
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct CommonRecord {
    pub header: RecordHeader,
    /// Device the record belongs to, 0 when no device was involved.
    pub device_tag: u32,
    /// Monotonic driver clock ticks.
    pub timestamp: u64,
    /// Tag of the capturing thread.
    pub thread_tag: u64,
    /// [`StateMask`] bits of the device at capture time.
    pub state_mask: u64,
}

impl CommonRecord {
    pub fn new(record_type: RecordType, device_tag: u32, timestamp: u64, state: StateMask) -> Self {
        Self {
            header: RecordHeader::new(RecordGroup::Rm, record_type, 0),
            device_tag,
            timestamp,
            thread_tag: current_thread_tag(),
            state_mask: state.bits(),
        }
    }

    pub fn record_type(&self) -> Option<RecordType> {
        self.header.record_type()
    }

    pub fn state(&self) -> StateMask {
        StateMask::from_bits_retain(self.state_mask)
    }
}

/// Small process-unique tag for the calling thread.
pub fn current_thread_tag() -> u64 {
    static NEXT_TAG: AtomicU64 = AtomicU64::new(1);

    thread_local! {
        static THREAD_TAG: u64 = NEXT_TAG.fetch_add(1, Ordering::Relaxed);
    }

    THREAD_TAG.with(|tag| *tag)
}

// ── Typed records ───────────────────────────────────────────────────────────

/// A record layout that starts with a [`CommonRecord`].
pub trait Record: FromBytes + IntoBytes + Immutable + KnownLayout + Sized {
    /// Record type a fresh record of this layout is stamped with.
    const TYPE: RecordType;

    fn common(&self) -> &CommonRecord;
    fn common_mut(&mut self) -> &mut CommonRecord;
}

macro_rules! impl_record {
    ($ty:ty, $record_type:expr) => {
        impl Record for $ty {
            const TYPE: RecordType = $record_type;

            fn common(&self) -> &CommonRecord {
                &self.common
            }

            fn common_mut(&mut self) -> &mut CommonRecord {
                &mut self.common
            }
        }
    };
}

/// Assertion or debug breakpoint, folded by address hint and call stack.
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct AssertRecord {
    pub common: CommonRecord,
    pub address_hint: u64,
    /// Timestamp of the most recent occurrence.
    pub last_timestamp: u64,
    pub source_line: u32,
    pub repeat_count: u32,
    pub level: u32,
    pub _reserved: u32,
    pub call_stack: [u64; CALL_STACK_DEPTH],
}

impl AssertRecord {
    /// Whether `other` describes the same assertion site.
    pub fn same_site(&self, address_hint: u64, call_stack: &[u64; CALL_STACK_DEPTH]) -> bool {
        self.address_hint == address_hint
            && self.call_stack[..QUALIFYING_STACK_SIZE] == call_stack[..QUALIFYING_STACK_SIZE]
    }
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct BugcheckRecord {
    pub common: CommonRecord,
    pub bugcheck_code: u32,
    pub _reserved: u32,
}

/// Header of a variable-length engine dump; `payload_len` bytes follow it.
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct EngineDumpRecord {
    pub common: CommonRecord,
    pub payload_len: u32,
    pub _reserved: u32,
}

/// Header of an arena collection; its `header.size` spans every member.
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct CollectionRecord {
    pub common: CommonRecord,
    pub num_records: u32,
    pub _reserved: u32,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct PowerStateRecord {
    pub common: CommonRecord,
    pub power_event: u32,
    pub state: u32,
    pub fast_boot_power_state: u32,
    pub _reserved: u32,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct RcDiagEntry {
    pub offset: u32,
    pub tag: u32,
    pub value: u64,
}

/// One RC error diagnostic report.
///
/// A logical report may span several records; the first carries
/// [`RcDiagFlags::FIRST`](crate::rc_diag::RcDiagFlags::FIRST) and the last
/// [`RcDiagFlags::LAST`](crate::rc_diag::RcDiagFlags::LAST).
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct RcDiagRecord {
    pub common: CommonRecord,
    pub idx: u16,
    pub _reserved0: u16,
    pub flags: u32,
    pub owner: u32,
    pub process_id: u32,
    pub record_type: u32,
    pub count: u32,
    pub data: [RcDiagEntry; RC_DIAG_MAX_ENTRIES],
}

/// Device identity and state copied into a NOCAT entry.
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct NocatDeviceState {
    /// 1 when a device was attached to the capture.
    pub valid: u32,
    pub tag: u32,
    pub device_id: u32,
    pub vendor_id: u32,
    pub subsystem_vendor_id: u32,
    pub subsystem_id: u32,
    pub revision: u32,
    pub _reserved: u32,
    pub state_mask: u64,
}

/// A NOCAT telemetry entry as stored in its ring buffer slot.
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct NocatRecord {
    pub common: CommonRecord,
    pub id: u32,
    /// Outstanding borrows of this slot.
    pub in_use: i32,
    pub record_type: u32,
    pub bugcheck: u32,
    pub subsystem: u32,
    /// Valid bytes in `diag_buffer`.
    pub diag_len: u32,
    pub error_code: u64,
    pub device_state: NocatDeviceState,
    pub source: [u8; NOCAT_MAX_STR_LEN],
    pub faulting_engine: [u8; NOCAT_MAX_STR_LEN],
    pub tdr_reason: [u8; NOCAT_TDR_REASON_LEN],
    pub diag_buffer: [u8; NOCAT_DIAG_BUFFER_LEN],
    pub _reserved: [u8; 6],
}

impl NocatRecord {
    pub fn diag(&self) -> &[u8] {
        let len = (self.diag_len as usize).min(NOCAT_DIAG_BUFFER_LEN);
        &self.diag_buffer[..len]
    }
}

/// Diagnostic payload of an ASSERT NOCAT entry.
///
/// Stack entries are stored relative to the driver load address.
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct AssertDiag {
    pub call_stack: [u32; CALL_STACK_DEPTH],
    pub count: u32,
}

impl_record!(AssertRecord, RecordType::Assert);
impl_record!(BugcheckRecord, RecordType::BugCheck);
impl_record!(EngineDumpRecord, RecordType::EngineDump);
impl_record!(CollectionRecord, RecordType::Collection);
impl_record!(PowerStateRecord, RecordType::PowerState);
impl_record!(RcDiagRecord, RecordType::RcDiagReport);
impl_record!(NocatRecord, RecordType::NocatReport);

const_assert_eq!(size_of::<RecordHeader>(), 4);
const_assert_eq!(size_of::<CommonRecord>(), 32);
const_assert_eq!(size_of::<AssertRecord>(), 144);
const_assert_eq!(size_of::<RcDiagRecord>(), 568);
const_assert_eq!(size_of::<NocatDeviceState>(), 40);
const_assert_eq!(size_of::<NocatRecord>(), 1296);
const_assert_eq!(size_of::<AssertDiag>(), 44);
assert_eq_size!(BugcheckRecord, EngineDumpRecord, CollectionRecord);

const_assert_eq!(size_of::<AssertRecord>() % RECORD_ALIGNMENT, 0);
const_assert_eq!(size_of::<BugcheckRecord>() % RECORD_ALIGNMENT, 0);
const_assert_eq!(size_of::<PowerStateRecord>() % RECORD_ALIGNMENT, 0);
const_assert_eq!(size_of::<RcDiagRecord>() % RECORD_ALIGNMENT, 0);
const_assert_eq!(size_of::<NocatRecord>() % RECORD_ALIGNMENT, 0);
const_assert!(size_of::<NocatRecord>() <= u16::MAX as usize);

/// Slot size of ring buffers holding `record_type`, or `None` for types that
/// never live in a ring buffer.
pub const fn ring_slot_size(record_type: RecordType) -> Option<usize> {
    match record_type {
        RecordType::PowerState => Some(size_of::<PowerStateRecord>()),
        RecordType::RcDiagReport => Some(size_of::<RcDiagRecord>()),
        RecordType::NocatReport => Some(size_of::<NocatRecord>()),
        _ => None,
    }
}

// ── Bounded strings ─────────────────────────────────────────────────────────

/// Copies `src` into `dst` as a NUL-terminated string, truncating as needed.
pub(crate) fn write_cstr(dst: &mut [u8], src: &str) {
    dst.fill(0);
    let Some(room) = dst.len().checked_sub(1) else {
        return;
    };
    let len = src.len().min(room);
    dst[..len].copy_from_slice(&src.as_bytes()[..len]);
}

pub(crate) fn read_cstr(src: &[u8]) -> String {
    let end = src.iter().position(|b| *b == 0).unwrap_or(src.len());
    String::from_utf8_lossy(&src[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::FromZeros;

    #[test]
    fn common_record_view() {
        let mut storage = [0u64; 4];
        let common = CommonRecord {
            header: RecordHeader::new(RecordGroup::Rm, RecordType::BugCheck, 32),
            device_tag: 7,
            timestamp: 1234,
            thread_tag: 3,
            state_mask: StateMask::IS_LOST.bits(),
        };
        common
            .write_to_prefix(storage.as_mut_bytes())
            .expect("storage fits a common record");

        let (view, _) = CommonRecord::ref_from_prefix(storage.as_bytes()).unwrap();
        assert_eq!(view, &common);
        assert_eq!(view.record_type(), Some(RecordType::BugCheck));
        assert_eq!(view.header.group(), Some(RecordGroup::Rm));
        assert!(view.state().contains(StateMask::IS_LOST));
    }

    #[test]
    fn slot_sizes() {
        assert_eq!(ring_slot_size(RecordType::PowerState), Some(48));
        assert_eq!(ring_slot_size(RecordType::NocatReport), Some(1296));
        assert_eq!(ring_slot_size(RecordType::Assert), None);
        assert_eq!(ring_slot_size(RecordType::FullDump), None);
    }

    #[test]
    fn align() {
        assert_eq!(align_up(0), 0);
        assert_eq!(align_up(1), 8);
        assert_eq!(align_up(40), 40);
        assert_eq!(align_up(41), 48);
    }

    #[test]
    fn same_site_uses_qualifying_prefix() {
        let mut record = AssertRecord::new_zeroed();
        record.address_hint = 0x1000;
        record.call_stack = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10];

        let mut other = record.call_stack;
        other[QUALIFYING_STACK_SIZE] = 99;
        assert!(record.same_site(0x1000, &other));

        other[0] = 99;
        assert!(!record.same_site(0x1000, &other));
        assert!(!record.same_site(0x2000, &record.call_stack));
    }

    #[test]
    fn bounded_strings() {
        let mut buf = [0xffu8; 8];
        write_cstr(&mut buf, "abc");
        assert_eq!(read_cstr(&buf), "abc");

        write_cstr(&mut buf, "0123456789");
        assert_eq!(buf[7], 0);
        assert_eq!(read_cstr(&buf), "0123456");

        let mut empty: [u8; 0] = [];
        write_cstr(&mut empty, "ignored");
    }

    #[test]
    fn thread_tags_differ_between_threads() {
        let here = current_thread_tag();
        assert_eq!(here, current_thread_tag());

        let there = std::thread::spawn(current_thread_tag).join().unwrap();
        assert_ne!(here, there);
    }
}
