//! Records a few events the way a driver would, then dumps the journal and
//! drains its NOCAT entries.
//!
//! Run with `RCDB_VERBOSE=1` for debug logs.

use anyhow::Context;
use rcdb::rc_diag::RcDiagFlags;
use rcdb::{
    AssertSite, ChannelWorkQueue, DeviceContext, DeviceIdentity, DriverVersion, Journal,
    JournalConfig, MemoryStore, ProduceError, RcDiagEntry, RcDiagReport, RecordingEncoder,
    StateMask, TdrReason,
};
use std::sync::Arc;
use tracing::info;

fn main() -> anyhow::Result<()> {
    let level = if std::env::var_os("RCDB_VERBOSE").is_some() {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let (queue, deferred) = ChannelWorkQueue::new(4);
    let journal = Journal::builder(JournalConfig::default().with_nocat_tag("demo"))
        .with_deferred_work(Arc::new(queue))
        .build()
        .context("failed to build journal")?;
    journal.init_device_cache(0x7f00_0000);

    let store = MemoryStore::new();
    let version = DriverVersion {
        version: "0.1.3".to_string(),
        branch: "main".to_string(),
        changelist: 1,
    };
    let previous = journal.save_previous_driver_version(&store, &version);
    info!(load_count = previous.load_count, "driver version saved");

    let device = DeviceContext::new(1)
        .with_state(StateMask::NOT_FULL_POWER)
        .with_identity(DeviceIdentity {
            device_id: 0x2684,
            vendor_id: 0x10de,
            ..DeviceIdentity::default()
        });

    let site = AssertSite {
        address_hint: 0x7f00_1234,
        line: 88,
        level: 0,
        call_stack: [0x7f00_1234, 0x7f00_2000, 0x7f00_3000, 0, 0, 0, 0, 0, 0, 0],
    };
    for _ in 0..3 {
        journal.record_assert(Some(&device), &site);
    }

    journal.add_power_state(Some(&device), 1, 3, 0)?;
    let entries = [RcDiagEntry {
        offset: 0x100,
        tag: 1,
        value: 0xdead_beef,
    }];
    journal.add_rc_diag(
        Some(&device),
        &RcDiagReport {
            owner: 0,
            process_id: std::process::id(),
            record_type: 0,
            flags: RcDiagFlags::FIRST | RcDiagFlags::LAST,
            entries: &entries,
        },
    )?;
    journal.nocat_insert_engine_error(Some(&device), "GR", 2, 0x0d, b"gr status");
    journal.set_tdr_reason(Some(&device), "KMD", 0, 0x116, TdrReason::FullChip as u32);
    journal.add_bugcheck(Some(&device), 0x116)?;

    // The first attempt cannot allocate and is retried from the worker side.
    let mut blocked = |_: &DeviceContext| Err::<Vec<u8>, _>(ProduceError::WouldBlock);
    journal.capture_device_dump(&device, &mut blocked)?;
    let mut producer = |device: &DeviceContext| Ok::<_, ProduceError>(device.tag.to_le_bytes().to_vec());
    for capture in deferred.try_iter() {
        journal.run_deferred_dump(capture, &mut producer)?;
    }

    let mut encoder = RecordingEncoder::new();
    let written = journal.dump(&mut encoder)?;
    info!(records = written, "journal dumped");
    println!("{}", serde_json::to_string_pretty(&encoder)?);

    while let Ok(report) = journal.report_next_nocat_entry() {
        println!("{}", serde_json::to_string(&report)?);
    }
    println!("{}", serde_json::to_string_pretty(&journal.nocat_counters())?);
    println!("{}", serde_json::to_string_pretty(&journal.stats())?);

    Ok(())
}
