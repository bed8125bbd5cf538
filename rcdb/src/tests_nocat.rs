use crate::*;
use proptest::prelude::*;
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Op {
    Insert,
    Report,
}

fn arb_ops() -> impl Strategy<Value = Vec<Op>> {
    proptest::collection::vec(prop_oneof![Just(Op::Insert), Just(Op::Report)], 0..64)
}

proptest! {
    #[test]
    fn outstanding_is_next_minus_reported(ops in arb_ops(), entries in 1usize..8) {
        let journal = Journal::builder(JournalConfig::default().with_nocat_entries(entries))
            .with_clock(Arc::new(ManualClock::new(1)))
            .build()
            .unwrap();

        let mut inserted = 0u32;
        let mut reported_up_to = 0u32;
        for op in ops {
            match op {
                Op::Insert => {
                    let id = journal.nocat_insert(&NocatParams::new(NocatRecordType::Engine), None);
                    prop_assert_eq!(id, Some(inserted));
                    inserted += 1;
                }
                Op::Report => match journal.report_next_nocat_entry() {
                    Ok(report) => {
                        // Entries pushed out of the ring are skipped.
                        let oldest_live = inserted.saturating_sub(entries as u32);
                        prop_assert_eq!(report.id, reported_up_to.max(oldest_live));
                        reported_up_to = report.id + 1;
                    }
                    Err(_) => {
                        prop_assert_eq!(inserted, reported_up_to);
                    }
                },
            }
            prop_assert_eq!(
                journal.nocat_outstanding_count().unwrap(),
                inserted - reported_up_to
            );
        }
    }
}
