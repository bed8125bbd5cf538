use crate::arena::Arena;
use crate::error::Result;
use crate::record::AssertRecord;
use rcdb_common::RecordType;

/// Offsets of the assertion records stored in the arena.
///
/// Repeated assertions with the same address hint and leading call stack are
/// folded into the first record's repeat count. The index can track at most
/// as many records as the arena could ever hold; records allocated past that
/// point are stored but never folded into.
#[derive(Debug)]
pub struct AssertIndex {
    offsets: Vec<usize>,
    capacity: usize,
}

impl AssertIndex {
    pub fn new(arena_capacity: usize) -> Self {
        let capacity = arena_capacity / size_of::<AssertRecord>();
        Self {
            offsets: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records one occurrence of `template`.
    ///
    /// With `compress` set, a tracked record for the same site absorbs the
    /// occurrence and a copy of it is returned with `false`. Otherwise a new
    /// record is allocated and returned with `true`.
    pub fn record(
        &mut self,
        arena: &mut Arena,
        record_type: RecordType,
        template: &AssertRecord,
        compress: bool,
    ) -> Result<(AssertRecord, bool)> {
        if compress {
            for &offset in &self.offsets {
                let existing = arena.record_mut::<AssertRecord>(offset)?;
                if existing.same_site(template.address_hint, &template.call_stack) {
                    existing.repeat_count = existing.repeat_count.saturating_add(1);
                    existing.last_timestamp = template.common.timestamp;
                    return Ok((*existing, false));
                }
            }
        }

        let offset = arena.allocate_record(record_type, template)?;
        if self.offsets.len() < self.capacity {
            self.offsets.push(offset);
        }

        Ok((*arena.record::<AssertRecord>(offset)?, true))
    }

    /// Tracked records, oldest first.
    pub fn iter<'a>(&'a self, arena: &'a Arena) -> impl Iterator<Item = &'a AssertRecord> + 'a {
        self.offsets
            .iter()
            .filter_map(|offset| arena.record::<AssertRecord>(*offset).ok())
    }
}
