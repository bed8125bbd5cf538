//! Diagnostic ring-buffer and crash-journal engine.
//!
//! A [`Journal`] records assertions, bugchecks, engine dumps, power and RC
//! events and NOCAT telemetry entries from a device driver, including from
//! contexts that must never block. Everything it holds can later be merged
//! into one time-ordered stream and handed to a [`RecordEncoder`].
//!
//! Storage comes in three flavours:
//! - an append-only [`Arena`] for assertions, bugchecks and engine dumps;
//! - typed [`RingBuffer`]s, shared and grown by every device that asks for
//!   capacity, for power events, RC diagnostic reports and NOCAT entries;
//! - the error history of full out-of-band device dumps.
//!
//! ```no_run
//! use rcdb::{Journal, JournalConfig, RecordingEncoder};
//!
//! # fn main() -> rcdb::Result<()> {
//! let journal = Journal::new(JournalConfig::default())?;
//! journal.add_bugcheck(None, 0x116)?;
//! journal.nocat_insert_bugcheck(None, 0x116);
//!
//! let mut encoder = RecordingEncoder::new();
//! journal.dump(&mut encoder)?;
//!
//! while let Ok(report) = journal.report_next_nocat_entry() {
//!     println!("{} {}", report.id, report.source);
//! }
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate static_assertions;

pub mod arena;
pub mod assert_index;
pub mod collab;
pub mod config;
pub mod driver_version;
pub mod dump;
pub mod error;
pub mod gate;
pub mod journal;
pub mod nocat;
pub mod rc_diag;
pub mod record;
pub mod ring;

#[cfg(test)]
mod tests_assert;
#[cfg(test)]
mod tests_nocat;
#[cfg(test)]
mod tests_ring;

pub use arena::Arena;
pub use assert_index::AssertIndex;
pub use collab::{
    AnyContext, AssumeReachable, AtomicContext, ChannelWorkQueue, Clock, DeferredCapture,
    DeferredWork, DeviceContext, DeviceIdentity, DeviceProbe, DumpProducer, ExecutionContext,
    ManualClock, MemoryStore, MonotonicClock, NoDeferredWork, UnsupportedStore, VolatileStore,
};
pub use config::JournalConfig;
pub use driver_version::{DriverVersion, PreviousDriver};
pub use dump::{
    DumpHeader, EncodedRecord, ErrorHistory, FullDump, OrderedView, RecordEncoder, RecordSource,
    RecordView, RecordingEncoder,
};
pub use error::{JournalError, ProduceError, Result, StoreError};
pub use gate::{Busy, Gate, GateGuard};
pub use journal::{
    AssertOutcome, AssertSite, DumpOutcome, Journal, JournalBuilder, StatsSnapshot, TimeReference,
};
pub use nocat::{CounterSnapshot, NocatCounter, NocatParams, NocatReport};
pub use rc_diag::{OwnerFilter, ProcessFilter, RcDiagFlags, RcDiagReport};
pub use record::{CommonRecord, RcDiagEntry, Record, RecordHeader};
pub use ring::{RingBuffer, RingBufferCollection};

pub use rcdb_common::{NocatRecordType, RecordGroup, RecordType, StateMask, TdrReason};
