use crate::record::PowerStateRecord;
use crate::*;
use proptest::prelude::*;

fn append(rings: &mut RingBufferCollection, timestamp: u64, event: u32) {
    let common = CommonRecord::new(RecordType::PowerState, 0, timestamp, StateMask::empty());
    let record = rings.append::<PowerStateRecord>(&common).unwrap();
    record.power_event = event;
}

fn events(rings: &RingBufferCollection) -> Vec<u32> {
    let ring = rings.find(RecordType::PowerState).unwrap();
    (0..ring.num_entries())
        .map(|i| ring.get::<PowerStateRecord>(i).unwrap().power_event)
        .collect()
}

proptest! {
    #[test]
    fn keeps_most_recent_entries_in_order(slots in 1usize..16, n in 0u32..64) {
        let mut rings = RingBufferCollection::new();
        rings.get_or_create(RecordType::PowerState, slots).unwrap();
        for event in 0..n {
            append(&mut rings, u64::from(event), event);
        }

        let kept = (n as usize).min(slots) as u32;
        let expected: Vec<u32> = (n - kept..n).collect();
        prop_assert_eq!(events(&rings), expected);
    }

    #[test]
    fn grow_preserves_slot_bytes(
        slots in 1usize..8,
        n in 0u32..24,
        extra in 1usize..8,
    ) {
        let mut rings = RingBufferCollection::new();
        rings.get_or_create(RecordType::PowerState, slots).unwrap();
        for event in 0..n {
            append(&mut rings, u64::from(event) * 10, event);
        }

        let before: Vec<Vec<u8>> = rings
            .find(RecordType::PowerState)
            .unwrap()
            .iter()
            .map(|slot| slot.to_vec())
            .collect();

        let ring = rings.get_or_create(RecordType::PowerState, extra).unwrap();
        prop_assert_eq!(ring.max_entries(), slots + extra);
        prop_assert_eq!(ring.ref_count(), 2);
        let after: Vec<Vec<u8>> = ring.iter().map(|slot| slot.to_vec()).collect();
        prop_assert_eq!(after, before);

        // New capacity is appended, not overwriting.
        let live = ring.num_entries();
        append(&mut rings, 1_000, 1_000);
        let ring = rings.find(RecordType::PowerState).unwrap();
        prop_assert_eq!(ring.num_entries(), live + 1);
    }
}
