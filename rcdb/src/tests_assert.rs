use crate::record::{AssertRecord, CALL_STACK_DEPTH};
use crate::*;
use proptest::prelude::*;

fn template(address_hint: u64, call_stack: [u64; CALL_STACK_DEPTH], timestamp: u64) -> AssertRecord {
    AssertRecord {
        common: CommonRecord::new(RecordType::Assert, 0, timestamp, StateMask::empty()),
        address_hint,
        last_timestamp: timestamp,
        repeat_count: 1,
        call_stack,
        ..AssertRecord::default()
    }
}

proptest! {
    #[test]
    fn identical_asserts_share_one_record(
        address_hint in any::<u64>(),
        call_stack in any::<[u64; CALL_STACK_DEPTH]>(),
        calls in 1u32..64,
    ) {
        let mut arena = Arena::new(32 * 1024);
        let mut index = AssertIndex::new(arena.capacity());

        for ts in 0..calls {
            let record = template(address_hint, call_stack, u64::from(ts));
            index.record(&mut arena, RecordType::Assert, &record, true).unwrap();
        }

        prop_assert_eq!(arena.record_count(), 1);
        let records: Vec<_> = index.iter(&arena).collect();
        prop_assert_eq!(records.len(), 1);
        prop_assert_eq!(records[0].repeat_count, calls);
        prop_assert_eq!(records[0].last_timestamp, u64::from(calls - 1));
    }

    #[test]
    fn journal_counts_repeats(address_hint in 1u64..1 << 40, calls in 1u32..32) {
        let journal = Journal::new(JournalConfig::default()).unwrap();
        let site = AssertSite {
            address_hint,
            ..AssertSite::default()
        };

        let mut last = None;
        for _ in 0..calls {
            last = Some(journal.record_assert(None, &site));
        }

        let last = last.unwrap();
        prop_assert_eq!(last.record.repeat_count, calls);
        prop_assert_eq!(journal.assert_records().unwrap().len(), 1);
        prop_assert_eq!(journal.nocat_outstanding_count().unwrap(), 1);
    }
}
