//! Integration tests for the time-ordered dump.

use rcdb::record::PowerStateRecord;
use rcdb::{
    DeviceContext, Journal, JournalConfig, ManualClock, ProduceError, RecordSource, RecordType,
    RecordingEncoder,
};
use std::sync::Arc;

fn journal(config: JournalConfig) -> (Journal, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(0));
    let journal = Journal::builder(config)
        .with_clock(clock.clone())
        .build()
        .expect("build journal");
    (journal, clock)
}

#[test]
fn wrapped_ring_yields_newest_entries() {
    let (journal, clock) = journal(JournalConfig::default());
    journal.attach_ring_owner(RecordType::PowerState, 3).unwrap();

    for ts in [10, 20, 30, 40] {
        clock.set(ts);
        journal.add_power_state(None, ts as u32, 0, 0).unwrap();
    }

    let timestamps = journal
        .with_ordered_view(|view, _| view.timestamps())
        .unwrap();
    assert_eq!(timestamps, [20, 30, 40]);
}

#[test]
fn merges_every_source_by_timestamp() {
    let (journal, clock) = journal(JournalConfig::default());
    let device = DeviceContext::new(1);

    clock.set(30);
    journal.add_bugcheck(Some(&device), 0x50).unwrap();
    clock.set(10);
    journal.add_power_state(Some(&device), 1, 2, 0).unwrap();
    clock.set(20);
    let mut producer = |_: &DeviceContext| Ok::<_, ProduceError>(vec![0u8; 64]);
    journal.capture_device_dump(&device, &mut producer).unwrap();
    clock.set(25);
    journal.nocat_insert_engine_error(Some(&device), "GR", 0, 1, &[]);
    clock.set(5);
    journal.add_engine_dump(Some(&device), &[1, 2, 3]).unwrap();

    let mut encoder = RecordingEncoder::new();
    let written = journal.dump(&mut encoder).unwrap();
    assert_eq!(written, 5);

    let order: Vec<_> = encoder
        .records
        .iter()
        .map(|r| (r.timestamp, r.record_type, r.source))
        .collect();
    assert_eq!(
        order,
        [
            (5, Some(RecordType::EngineDump), RecordSource::Arena),
            (10, Some(RecordType::PowerState), RecordSource::Ring),
            (20, Some(RecordType::FullDump), RecordSource::FullDump),
            (25, Some(RecordType::NocatReport), RecordSource::Ring),
            (30, Some(RecordType::BugCheck), RecordSource::Arena),
        ]
    );

    let header = encoder.header.unwrap();
    assert_eq!(header.record_count, 5);
    assert_eq!(header.timestamp_frequency, 1_000_000_000);
    assert!(encoder.finished);
}

#[test]
fn equal_timestamps_keep_ring_history_arena_order() {
    let (journal, clock) = journal(JournalConfig::default());
    let device = DeviceContext::new(2);
    clock.set(7);

    journal.add_bugcheck(None, 1).unwrap();
    let mut producer = |_: &DeviceContext| Ok::<_, ProduceError>(vec![1]);
    journal.capture_device_dump(&device, &mut producer).unwrap();
    journal.add_power_state(None, 0, 0, 0).unwrap();

    let sources = journal
        .with_ordered_view(|view, _| view.iter().map(|r| r.source).collect::<Vec<_>>())
        .unwrap();
    assert_eq!(
        sources,
        [RecordSource::Ring, RecordSource::FullDump, RecordSource::Arena]
    );
}

#[test]
fn typed_ring_records_survive_the_merge() {
    let (journal, clock) = journal(JournalConfig::default());
    clock.set(3);
    journal.add_power_state(None, 4, 5, 6).unwrap();

    let fields = journal
        .with_ordered_view(|view, _| {
            view.iter()
                .find_map(|r| r.as_record::<PowerStateRecord>())
                .map(|r| (r.power_event, r.state, r.fast_boot_power_state))
        })
        .unwrap();
    assert_eq!(fields, Some((4, 5, 6)));
}

#[test]
fn cleared_history_leaves_the_dump() {
    let (journal, _) = journal(JournalConfig::default());
    let device = DeviceContext::new(1);
    let mut producer = |_: &DeviceContext| Ok::<_, ProduceError>(vec![1, 2]);
    journal.capture_device_dump(&device, &mut producer).unwrap();
    assert_eq!(journal.clear_error_history().unwrap(), 1);

    let mut encoder = RecordingEncoder::new();
    assert_eq!(journal.dump(&mut encoder).unwrap(), 0);
}
