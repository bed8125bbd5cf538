//! Typed ring buffers.
//!
//! A [`RingBuffer`] holds fixed-size slots of a single record type and
//! overwrites its oldest slot once full. Several logical owners (typically
//! one per device) can ask for capacity in the same buffer: each request
//! grows it and takes a reference, and the buffer is freed when the last
//! reference is released.

use crate::error::{JournalError, Result};
use crate::record::{CommonRecord, Record, RecordHeader, ring_slot_size};
use rcdb_common::{RecordGroup, RecordType};
use zerocopy::{FromBytes, IntoBytes};

/// Upper bound on owners sharing one ring buffer; caps its growth at this
/// many times its first allocation.
pub const MAX_LOGICAL_OWNERS: usize = 32;

#[derive(Debug)]
pub struct RingBuffer {
    record_type: RecordType,
    slot_size: usize,
    max_entries: usize,
    ref_count: u32,
    /// Physical slot of the oldest entry.
    head: usize,
    num_entries: usize,
    /// Byte size of the first allocation.
    base_bytes: usize,
    storage: Vec<u64>,
}

impl RingBuffer {
    pub fn new(record_type: RecordType, slots: usize) -> Result<Self> {
        let slot_size = ring_slot_size(record_type)
            .ok_or(JournalError::InvalidArgument("record type has no ring layout"))?;
        if slots == 0 {
            return Err(JournalError::InvalidArgument("ring buffer needs at least one slot"));
        }
        let bytes = slots
            .checked_mul(slot_size)
            .ok_or(JournalError::InvalidArgument("ring buffer too large"))?;

        Ok(Self {
            record_type,
            slot_size,
            max_entries: slots,
            ref_count: 1,
            head: 0,
            num_entries: 0,
            base_bytes: bytes,
            storage: vec![0; bytes / size_of::<u64>()],
        })
    }

    pub fn record_type(&self) -> RecordType {
        self.record_type
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn num_entries(&self) -> usize {
        self.num_entries
    }

    pub fn is_empty(&self) -> bool {
        self.num_entries == 0
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    pub fn storage_bytes(&self) -> usize {
        self.storage.len() * size_of::<u64>()
    }

    /// Largest size the buffer may grow to.
    pub fn byte_limit(&self) -> usize {
        self.base_bytes.saturating_mul(MAX_LOGICAL_OWNERS)
    }

    /// Adds `slots` of capacity for one more owner.
    ///
    /// Live entries are moved to the front, oldest first, so that slot order
    /// stays append order. On failure the buffer is left untouched.
    pub fn grow(&mut self, slots: usize) -> Result<()> {
        if slots == 0 {
            return Err(JournalError::InvalidArgument("ring buffer needs at least one slot"));
        }

        let limit = self.byte_limit();
        let new_bytes = self
            .max_entries
            .checked_add(slots)
            .and_then(|entries| entries.checked_mul(self.slot_size))
            .filter(|bytes| *bytes <= limit)
            .ok_or(JournalError::GrowLimit {
                record_type: self.record_type,
                limit,
            })?;

        let mut storage = vec![0u64; new_bytes / size_of::<u64>()];
        {
            let dst = storage.as_mut_bytes();
            for (logical, slot) in self.iter().enumerate() {
                let start = logical * self.slot_size;
                dst[start..start + self.slot_size].copy_from_slice(slot);
            }
        }

        self.storage = storage;
        self.head = 0;
        self.max_entries += slots;
        self.ref_count += 1;
        Ok(())
    }

    /// Claims the next slot, overwriting the oldest entry when full.
    ///
    /// The slot is zeroed and starts with `common`, its header restamped for
    /// this buffer. The caller fills in the rest.
    pub fn append_slot(&mut self, common: &CommonRecord) -> Result<&mut [u8]> {
        let physical = (self.head + self.num_entries) % self.max_entries;
        if self.num_entries < self.max_entries {
            self.num_entries += 1;
        } else {
            self.head = (self.head + 1) % self.max_entries;
        }

        let record_type = self.record_type;
        let mut common = *common;
        common.header = RecordHeader::new(RecordGroup::Rm, record_type, self.slot_size as u16);

        let slot = self.physical_slot_mut(physical);
        slot.fill(0);
        common
            .write_to_prefix(slot)
            .map_err(|_| JournalError::Layout { record_type })?;
        Ok(slot)
    }

    /// Slot bytes by position relative to the oldest entry.
    pub fn slot(&self, logical: usize) -> Option<&[u8]> {
        if logical >= self.num_entries {
            return None;
        }
        let physical = (self.head + logical) % self.max_entries;
        let start = physical * self.slot_size;
        Some(&self.storage.as_bytes()[start..start + self.slot_size])
    }

    pub fn slot_mut(&mut self, logical: usize) -> Option<&mut [u8]> {
        if logical >= self.num_entries {
            return None;
        }
        let physical = (self.head + logical) % self.max_entries;
        Some(self.physical_slot_mut(physical))
    }

    pub fn get<R: Record>(&self, logical: usize) -> Option<&R> {
        self.slot(logical)
            .and_then(|bytes| R::ref_from_prefix(bytes).ok())
            .map(|(record, _)| record)
    }

    pub fn get_mut<R: Record>(&mut self, logical: usize) -> Option<&mut R> {
        self.slot_mut(logical)
            .and_then(|bytes| R::mut_from_prefix(bytes).ok())
            .map(|(record, _)| record)
    }

    /// Live slots, oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &[u8]> + '_ {
        (0..self.num_entries).filter_map(|logical| self.slot(logical))
    }

    /// Common records of the live slots, oldest to newest.
    pub fn commons(&self) -> impl Iterator<Item = &CommonRecord> + '_ {
        self.iter()
            .filter_map(|slot| CommonRecord::ref_from_prefix(slot).ok())
            .map(|(common, _)| common)
    }

    fn physical_slot_mut(&mut self, physical: usize) -> &mut [u8] {
        let start = physical * self.slot_size;
        &mut self.storage.as_mut_bytes()[start..start + self.slot_size]
    }
}

/// Every ring buffer, at most one per record type.
#[derive(Debug, Default)]
pub struct RingBufferCollection {
    buffers: Vec<RingBuffer>,
}

impl RingBufferCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the buffer for `record_type`, or grows the existing one, by
    /// `additional_slots`.
    pub fn get_or_create(
        &mut self,
        record_type: RecordType,
        additional_slots: usize,
    ) -> Result<&mut RingBuffer> {
        match self.position(record_type) {
            Some(pos) => {
                let ring = &mut self.buffers[pos];
                ring.grow(additional_slots)?;
                Ok(ring)
            }
            None => {
                let ring = RingBuffer::new(record_type, additional_slots)?;
                self.buffers.push(ring);
                let last = self.buffers.len() - 1;
                Ok(&mut self.buffers[last])
            }
        }
    }

    pub fn find(&self, record_type: RecordType) -> Option<&RingBuffer> {
        self.buffers.iter().find(|ring| ring.record_type == record_type)
    }

    pub fn find_mut(&mut self, record_type: RecordType) -> Option<&mut RingBuffer> {
        self.buffers
            .iter_mut()
            .find(|ring| ring.record_type == record_type)
    }

    /// Appends a `R` record to its ring buffer and returns it for the caller
    /// to fill in.
    pub fn append<R: Record>(&mut self, common: &CommonRecord) -> Result<&mut R> {
        let record_type = R::TYPE;
        let ring = self
            .find_mut(record_type)
            .ok_or(JournalError::NoRingBuffer { record_type })?;
        let slot = ring.append_slot(common)?;
        R::mut_from_prefix(slot)
            .map(|(record, _)| record)
            .map_err(|_| JournalError::Layout { record_type })
    }

    /// Drops one reference to the buffer for `record_type`, freeing it at
    /// zero. Returns the references left.
    pub fn destroy(&mut self, record_type: RecordType) -> Result<u32> {
        let pos = self
            .position(record_type)
            .ok_or(JournalError::NoRingBuffer { record_type })?;

        let ring = &mut self.buffers[pos];
        ring.ref_count = ring.ref_count.saturating_sub(1);
        let left = ring.ref_count;
        if left == 0 {
            self.buffers.remove(pos);
        }
        Ok(left)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RingBuffer> {
        self.buffers.iter()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    fn position(&self, record_type: RecordType) -> Option<usize> {
        self.buffers
            .iter()
            .position(|ring| ring.record_type == record_type)
    }
}
