use serde::ser::{Serialize, SerializeMap, Serializer};
use std::sync::atomic::{AtomicU32, Ordering};

/// Named NOCAT event counters.
///
/// Every path through the NOCAT journal, successful or not, bumps one of
/// these instead of surfacing an error to the producer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum NocatCounter {
    /// Insert requests
    CollectReq,
    /// Ring slots handed out
    Allocated,
    /// Entries fully written
    Collected,
    /// Ring slot allocation failures
    AllocFailed,
    /// Inserts that did not produce an entry
    CollectFailed,
    /// Non-priority entries dropped while locked
    CollectLockedOut,
    /// Entries admitted while locked because they predate the lock
    Grandfathered,
    /// Inserts skipped because the gate was held
    Busy,
    /// Inserts with an unusable record type
    BadParam,
    /// Caller buffers that could not be used
    BadBuffer,
    /// Report requests
    Requested,
    /// Entries handed to the reporter
    Reported,
    /// Entries overwritten before they were reported
    Dropped,
    /// Lookups on an empty journal
    NoRecords,
    /// Lookups that hit the requested id
    MatchFound,
    /// Lookups that found nothing usable
    NoMatch,
    /// Lookups resolved to the oldest live entry
    ClosestFound,
    JournalLocked,
    JournalLockUpdated,
    JournalUnlocked,
    Notifications,
    NotificationFail,
    UpdateReq,
    Updated,
    /// Diagnostic payloads cut to the buffer capacity
    DiagTruncated,
}

impl NocatCounter {
    pub const COUNT: usize = 25;

    pub const ALL: [NocatCounter; Self::COUNT] = [
        NocatCounter::CollectReq,
        NocatCounter::Allocated,
        NocatCounter::Collected,
        NocatCounter::AllocFailed,
        NocatCounter::CollectFailed,
        NocatCounter::CollectLockedOut,
        NocatCounter::Grandfathered,
        NocatCounter::Busy,
        NocatCounter::BadParam,
        NocatCounter::BadBuffer,
        NocatCounter::Requested,
        NocatCounter::Reported,
        NocatCounter::Dropped,
        NocatCounter::NoRecords,
        NocatCounter::MatchFound,
        NocatCounter::NoMatch,
        NocatCounter::ClosestFound,
        NocatCounter::JournalLocked,
        NocatCounter::JournalLockUpdated,
        NocatCounter::JournalUnlocked,
        NocatCounter::Notifications,
        NocatCounter::NotificationFail,
        NocatCounter::UpdateReq,
        NocatCounter::Updated,
        NocatCounter::DiagTruncated,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            NocatCounter::CollectReq => "collect_req",
            NocatCounter::Allocated => "allocated",
            NocatCounter::Collected => "collected",
            NocatCounter::AllocFailed => "alloc_failed",
            NocatCounter::CollectFailed => "collect_failed",
            NocatCounter::CollectLockedOut => "collect_locked_out",
            NocatCounter::Grandfathered => "grandfathered",
            NocatCounter::Busy => "busy",
            NocatCounter::BadParam => "bad_param",
            NocatCounter::BadBuffer => "bad_buffer",
            NocatCounter::Requested => "requested",
            NocatCounter::Reported => "reported",
            NocatCounter::Dropped => "dropped",
            NocatCounter::NoRecords => "no_records",
            NocatCounter::MatchFound => "match_found",
            NocatCounter::NoMatch => "no_match",
            NocatCounter::ClosestFound => "closest_found",
            NocatCounter::JournalLocked => "journal_locked",
            NocatCounter::JournalLockUpdated => "journal_lock_updated",
            NocatCounter::JournalUnlocked => "journal_unlocked",
            NocatCounter::Notifications => "notifications",
            NocatCounter::NotificationFail => "notification_fail",
            NocatCounter::UpdateReq => "update_req",
            NocatCounter::Updated => "updated",
            NocatCounter::DiagTruncated => "diag_truncated",
        }
    }
}

/// The counters themselves. They live outside the gate so that paths which
/// fail to enter it can still be counted.
#[derive(Debug)]
pub struct EventCounters {
    values: [AtomicU32; NocatCounter::COUNT],
}

impl Default for EventCounters {
    fn default() -> Self {
        Self {
            values: std::array::from_fn(|_| AtomicU32::new(0)),
        }
    }
}

impl EventCounters {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn incr(&self, counter: NocatCounter) {
        self.add(counter, 1);
    }

    /// Adds `n`, wrapping on overflow.
    #[inline]
    pub fn add(&self, counter: NocatCounter, n: u32) {
        self.values[counter as usize].fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, counter: NocatCounter) -> u32 {
        self.values[counter as usize].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            values: std::array::from_fn(|idx| self.values[idx].load(Ordering::Relaxed)),
        }
    }
}

/// Point-in-time copy of [`EventCounters`]; serializes as a name → value map.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CounterSnapshot {
    values: [u32; NocatCounter::COUNT],
}

impl CounterSnapshot {
    pub fn get(&self, counter: NocatCounter) -> u32 {
        self.values[counter as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = (NocatCounter, u32)> + '_ {
        NocatCounter::ALL
            .iter()
            .map(|counter| (*counter, self.values[*counter as usize]))
    }
}

impl Serialize for CounterSnapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(NocatCounter::COUNT))?;
        for (counter, value) in self.iter() {
            map.serialize_entry(counter.name(), &value)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_is_in_discriminant_order() {
        for (idx, counter) in NocatCounter::ALL.iter().enumerate() {
            assert_eq!(*counter as usize, idx);
        }
    }

    #[test]
    fn counts_and_wraps() {
        let counters = EventCounters::new();
        counters.incr(NocatCounter::Busy);
        counters.incr(NocatCounter::Busy);
        counters.add(NocatCounter::Dropped, 5);
        assert_eq!(counters.get(NocatCounter::Busy), 2);
        assert_eq!(counters.get(NocatCounter::Dropped), 5);
        assert_eq!(counters.get(NocatCounter::Reported), 0);

        counters.add(NocatCounter::Dropped, u32::MAX);
        assert_eq!(counters.get(NocatCounter::Dropped), 4);
    }

    #[test]
    fn snapshot_serializes_by_name() {
        let counters = EventCounters::new();
        counters.add(NocatCounter::Grandfathered, 3);

        let snapshot = counters.snapshot();
        counters.incr(NocatCounter::Grandfathered);
        assert_eq!(snapshot.get(NocatCounter::Grandfathered), 3);

        let json = serde_json::to_value(snapshot).unwrap();
        assert_eq!(json["grandfathered"], 3);
        assert_eq!(json["collect_req"], 0);
        assert_eq!(json.as_object().unwrap().len(), NocatCounter::COUNT);
    }
}
