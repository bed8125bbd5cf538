//! Bump-allocated record arena.
//!
//! The arena is a fixed block of 8-byte aligned storage. Records are appended
//! one after another and never reclaimed; the stream is self-describing
//! through each record's [`RecordHeader`], which is how the dump merge walks
//! it back.
//!
//! A collection groups the records allocated while it is open: the
//! collection header's size grows to span its members and the group is
//! walked as one record.

use crate::error::{JournalError, Result};
use crate::record::{CollectionRecord, CommonRecord, Record, RecordHeader, align_up};
use rcdb_common::{RecordGroup, RecordType};
use zerocopy::{FromBytes, IntoBytes};

#[derive(Debug)]
pub struct Arena {
    storage: Vec<u64>,
    used: usize,
    record_count: u32,
    /// Offset of the open collection record.
    collection: Option<usize>,
}

impl Arena {
    /// Creates an arena of `capacity` bytes, rounded down to the record
    /// alignment. A zero capacity arena rejects every allocation.
    pub fn new(capacity: usize) -> Self {
        Self {
            storage: vec![0; capacity / size_of::<u64>()],
            used: 0,
            record_count: 0,
            collection: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.storage.len() * size_of::<u64>()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn remaining(&self) -> usize {
        self.capacity() - self.used
    }

    /// Number of top-level records, collections counting as one.
    pub fn record_count(&self) -> u32 {
        self.record_count
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn in_collection(&self) -> bool {
        self.collection.is_some()
    }

    /// Allocates a zeroed record of `size` bytes and writes its header.
    ///
    /// Returns the offset of the new record.
    pub fn allocate(
        &mut self,
        group: RecordGroup,
        record_type: RecordType,
        size: usize,
    ) -> Result<usize> {
        if size == 0 {
            return Err(JournalError::InvalidArgument("zero-sized record"));
        }
        if size < size_of::<CommonRecord>() {
            return Err(JournalError::InvalidArgument(
                "record smaller than the common header",
            ));
        }
        let size = align_up(size);
        if size > u16::MAX as usize {
            return Err(JournalError::InvalidArgument("record larger than 64 KiB"));
        }

        let remaining = self.remaining();
        if size > remaining {
            return Err(JournalError::Full {
                requested: size,
                remaining,
            });
        }

        // Checked before anything is written so a failure leaves no trace.
        let collection = match self.collection {
            Some(offset) => {
                let header = self.header(offset)?;
                let grown = header.size() + size;
                if grown > u16::MAX as usize {
                    return Err(JournalError::InvalidArgument(
                        "collection larger than 64 KiB",
                    ));
                }
                Some((offset, grown as u16))
            }
            None => None,
        };

        let offset = self.used;
        let bytes = &mut self.storage.as_mut_bytes()[offset..offset + size];
        bytes.fill(0);
        RecordHeader::new(group, record_type, size as u16)
            .write_to_prefix(bytes)
            .map_err(|_| JournalError::Layout { record_type })?;
        self.used += size;

        match collection {
            Some((coll_offset, grown)) => {
                let coll = self.record_mut::<CollectionRecord>(coll_offset)?;
                coll.common.header.size = grown;
                coll.num_records += 1;
            }
            None => self.record_count += 1,
        }

        Ok(offset)
    }

    /// Copies `record` into a fresh allocation stamped with `record_type`.
    pub fn allocate_record<R: Record>(
        &mut self,
        record_type: RecordType,
        record: &R,
    ) -> Result<usize> {
        self.allocate_with_payload(record_type, record, &[])
    }

    /// Like [`Self::allocate_record`], with `payload` appended right after
    /// the record.
    pub fn allocate_with_payload<R: Record>(
        &mut self,
        record_type: RecordType,
        record: &R,
        payload: &[u8],
    ) -> Result<usize> {
        let fixed = size_of::<R>();
        let offset = self.allocate(RecordGroup::Rm, record_type, fixed + payload.len())?;
        let header = self.header(offset)?;

        let bytes = &mut self.storage.as_mut_bytes()[offset..offset + header.size()];
        bytes[..fixed].copy_from_slice(record.as_bytes());
        bytes[fixed..fixed + payload.len()].copy_from_slice(payload);
        header
            .write_to_prefix(bytes)
            .map_err(|_| JournalError::Layout { record_type })?;

        Ok(offset)
    }

    /// Opens a collection; records allocated until [`Self::end_collection`]
    /// become its members.
    pub fn begin_collection(&mut self, common: CommonRecord) -> Result<usize> {
        if self.collection.is_some() {
            return Err(JournalError::InvalidArgument("collection already open"));
        }

        let record = CollectionRecord {
            common,
            num_records: 0,
            _reserved: 0,
        };
        let offset = self.allocate_record(RecordType::Collection, &record)?;
        self.collection = Some(offset);
        Ok(offset)
    }

    /// Closes the open collection and returns its offset.
    pub fn end_collection(&mut self) -> Option<usize> {
        self.collection.take()
    }

    pub fn header(&self, offset: usize) -> Result<RecordHeader> {
        let bytes = self.used_bytes().get(offset..).unwrap_or_default();
        RecordHeader::read_from_prefix(bytes)
            .map(|(header, _)| header)
            .map_err(|_| JournalError::InvalidArgument("offset outside the arena"))
    }

    pub fn record<R: Record>(&self, offset: usize) -> Result<&R> {
        let bytes = self.used_bytes().get(offset..).unwrap_or_default();
        R::ref_from_prefix(bytes)
            .map(|(record, _)| record)
            .map_err(|_| JournalError::Layout {
                record_type: R::TYPE,
            })
    }

    pub fn record_mut<R: Record>(&mut self, offset: usize) -> Result<&mut R> {
        let used = self.used;
        let bytes = self.storage.as_mut_bytes()[..used]
            .get_mut(offset..)
            .unwrap_or_default();
        R::mut_from_prefix(bytes)
            .map(|(record, _)| record)
            .map_err(|_| JournalError::Layout {
                record_type: R::TYPE,
            })
    }

    /// Bytes of the record at `offset`, as declared by its header.
    pub fn record_bytes(&self, offset: usize) -> Result<&[u8]> {
        let size = self.header(offset)?.size();
        self.used_bytes()
            .get(offset..offset + size)
            .ok_or(JournalError::InvalidArgument("record extends past the arena"))
    }

    pub fn records(&self) -> ArenaRecords<'_> {
        ArenaRecords {
            bytes: self.used_bytes(),
            pos: 0,
        }
    }

    fn used_bytes(&self) -> &[u8] {
        &self.storage.as_bytes()[..self.used]
    }
}

/// A top-level record found while walking the arena.
#[derive(Debug, Copy, Clone)]
pub struct ArenaRecord<'a> {
    pub offset: usize,
    pub common: &'a CommonRecord,
    pub bytes: &'a [u8],
}

/// Walks the arena's record stream front to back.
///
/// The walk stops early, without error, at the first record whose group is
/// not [`RecordGroup::Rm`] or whose size is zero, smaller than a common
/// record, or larger than the bytes left.
pub struct ArenaRecords<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for ArenaRecords<'a> {
    type Item = ArenaRecord<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = &self.bytes[self.pos..];
        if rest.len() < size_of::<CommonRecord>() {
            return None;
        }

        let (common, _) = CommonRecord::ref_from_prefix(rest).ok()?;
        let size = common.header.size();
        let valid = common.header.group() == Some(RecordGroup::Rm)
            && size >= size_of::<CommonRecord>()
            && size <= rest.len();
        if !valid {
            self.pos = self.bytes.len();
            return None;
        }

        let record = ArenaRecord {
            offset: self.pos,
            common,
            bytes: &rest[..size],
        };
        self.pos += size;
        Some(record)
    }
}
