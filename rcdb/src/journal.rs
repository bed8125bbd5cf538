//! The journal context object.
//!
//! A [`Journal`] owns the arena, the ring buffers, the NOCAT and RC
//! diagnostic bookkeeping and the full-dump history, each behind a
//! non-blocking [`Gate`]:
//!
//! * `state` guards the ring buffers, NOCAT and RC diagnostics;
//! * `events` guards the arena and the assertion index, so assertions can
//!   still be recorded while `state` is held further up the stack;
//! * `history` guards the full device dumps.
//!
//! Capture paths never wait. When a gate is held they count the miss and
//! move on. Only the dump path and history clearing retry, and only when
//! the [`ExecutionContext`] says the caller may block.

use crate::arena::Arena;
use crate::assert_index::AssertIndex;
use crate::collab::{
    AnyContext, AssumeReachable, Clock, DeferredCapture, DeferredWork, DeviceContext,
    DeviceProbe, DumpProducer, ExecutionContext, MonotonicClock, NoDeferredWork, VolatileStore,
};
use crate::config::JournalConfig;
use crate::driver_version::{DriverVersion, PreviousDriver, save_previous_driver_version};
use crate::dump::{DumpHeader, ErrorHistory, FullDump, OrderedView, RecordEncoder};
use crate::error::{JournalError, ProduceError, Result};
use crate::gate::{Busy, Gate, GateGuard};
use crate::nocat::{
    AssertStack, CounterSnapshot, EventCounters, NocatCounter, NocatJournal, NocatParams,
    NocatReport,
};
use crate::rc_diag::{OwnerFilter, ProcessFilter, RcDiagLog, RcDiagReport};
use crate::record::{
    AssertDiag, AssertRecord, BugcheckRecord, CALL_STACK_DEPTH, CommonRecord, EngineDumpRecord,
    PowerStateRecord, RcDiagRecord, Record, write_cstr,
};
use crate::ring::RingBufferCollection;
use rcdb_common::{NocatRecordType, RecordType, StateMask, TdrReason};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, instrument, warn};
use zerocopy::IntoBytes;

// ── Gated state ─────────────────────────────────────────────────────────────

/// Everything behind the main gate.
#[derive(Debug, Default)]
pub struct JournalState {
    pub rings: RingBufferCollection,
    pub nocat: NocatJournal,
    pub rc_diag: RcDiagLog,
}

/// The arena and the assertion index over it.
#[derive(Debug)]
pub struct EventLog {
    pub arena: Arena,
    pub asserts: AssertIndex,
}

// ── Statistics ──────────────────────────────────────────────────────────────

/// Journal-level counters; NOCAT has its own in [`EventCounters`].
#[derive(Debug, Default)]
pub struct JournalStats {
    dump_busy: AtomicU64,
    event_busy: AtomicU64,
    ring_busy: AtomicU64,
    arena_full: AtomicU64,
    asserts_folded: AtomicU64,
    bugchecks: AtomicU64,
    deferred_dumps: AtomicU64,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Dumps and history clears that gave up on a busy gate
    pub dump_busy: u64,
    /// Arena captures skipped because the event gate was held
    pub event_busy: u64,
    /// Ring captures skipped because the main gate was held
    pub ring_busy: u64,
    pub arena_full: u64,
    pub asserts_folded: u64,
    pub bugchecks: u64,
    pub deferred_dumps: u64,
}

impl JournalStats {
    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            dump_busy: self.dump_busy.load(Ordering::Relaxed),
            event_busy: self.event_busy.load(Ordering::Relaxed),
            ring_busy: self.ring_busy.load(Ordering::Relaxed),
            arena_full: self.arena_full.load(Ordering::Relaxed),
            asserts_folded: self.asserts_folded.load(Ordering::Relaxed),
            bugchecks: self.bugchecks.load(Ordering::Relaxed),
            deferred_dumps: self.deferred_dumps.load(Ordering::Relaxed),
        }
    }
}

// ── Time ────────────────────────────────────────────────────────────────────

/// Maps clock ticks to wall-clock time.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct TimeReference {
    frequency: u64,
    /// Unix time in microseconds at tick zero.
    reference_micros: u64,
}

impl TimeReference {
    pub fn new(ticks: u64, frequency: u64, wallclock_micros: u64) -> Self {
        let frequency = frequency.max(1);
        let elapsed = ticks_to_micros(ticks, frequency);
        Self {
            frequency,
            reference_micros: wallclock_micros.saturating_sub(elapsed),
        }
    }

    pub fn frequency(&self) -> u64 {
        self.frequency
    }

    pub fn reference_micros(&self) -> u64 {
        self.reference_micros
    }

    pub fn ticks_to_unix_micros(&self, ticks: u64) -> u64 {
        self.reference_micros
            .saturating_add(ticks_to_micros(ticks, self.frequency))
    }
}

fn ticks_to_micros(ticks: u64, frequency: u64) -> u64 {
    let micros = ticks as u128 * 1_000_000 / frequency as u128;
    u64::try_from(micros).unwrap_or(u64::MAX)
}

// ── Capture arguments ───────────────────────────────────────────────────────

/// Where an assertion fired.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct AssertSite {
    pub address_hint: u64,
    pub line: u32,
    pub level: u32,
    pub call_stack: [u64; CALL_STACK_DEPTH],
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AssertOutcome {
    /// The stored record after this occurrence, or the record that would
    /// have been stored.
    pub record: AssertRecord,
    /// False when the occurrence was folded into an existing record.
    pub is_new: bool,
    /// False when the record could not be written to the arena.
    pub stored: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DumpOutcome {
    /// The dump was added to the error history.
    Stored,
    /// The producer could not run here; a retry was queued.
    Deferred,
}

// ── Builder ─────────────────────────────────────────────────────────────────

pub struct JournalBuilder {
    config: JournalConfig,
    clock: Arc<dyn Clock>,
    probe: Arc<dyn DeviceProbe>,
    context: Arc<dyn ExecutionContext>,
    deferred: Arc<dyn DeferredWork>,
}

impl JournalBuilder {
    pub fn new(config: JournalConfig) -> Self {
        Self {
            config,
            clock: Arc::new(MonotonicClock),
            probe: Arc::new(AssumeReachable),
            context: Arc::new(AnyContext),
            deferred: Arc::new(NoDeferredWork),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn DeviceProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_context(mut self, context: Arc<dyn ExecutionContext>) -> Self {
        self.context = context;
        self
    }

    pub fn with_deferred_work(mut self, deferred: Arc<dyn DeferredWork>) -> Self {
        self.deferred = deferred;
        self
    }

    pub fn build(self) -> Result<Journal> {
        let config = self.config;

        let mut state = JournalState::default();
        state
            .rings
            .get_or_create(RecordType::NocatReport, config.nocat_entries)?;
        state
            .rings
            .get_or_create(RecordType::RcDiagReport, config.rc_diag_entries)?;

        let events = EventLog {
            arena: Arena::new(config.arena_size),
            asserts: AssertIndex::new(config.arena_size),
        };

        let time_reference = TimeReference::new(
            self.clock.timestamp(),
            self.clock.frequency(),
            self.clock.wallclock_micros(),
        );

        info!(
            arena_size = config.arena_size,
            nocat_entries = config.nocat_entries,
            rc_diag_entries = config.rc_diag_entries,
            compress = config.compress,
            "journal initialized"
        );

        Ok(Journal {
            config,
            state: Gate::new(state),
            events: Gate::new(events),
            history: Gate::new(ErrorHistory::new()),
            counters: EventCounters::new(),
            stats: JournalStats::default(),
            clock: self.clock,
            probe: self.probe,
            context: self.context,
            deferred: self.deferred,
            load_address: AtomicU64::new(0),
            dump_in_progress: AtomicBool::new(false),
            deferral_pending: AtomicBool::new(false),
            time_reference,
            previous_driver: OnceLock::new(),
        })
    }
}

// ── Journal ─────────────────────────────────────────────────────────────────

pub struct Journal {
    config: JournalConfig,
    state: Gate<JournalState>,
    events: Gate<EventLog>,
    history: Gate<ErrorHistory>,
    counters: EventCounters,
    stats: JournalStats,
    clock: Arc<dyn Clock>,
    probe: Arc<dyn DeviceProbe>,
    context: Arc<dyn ExecutionContext>,
    deferred: Arc<dyn DeferredWork>,
    load_address: AtomicU64,
    dump_in_progress: AtomicBool,
    /// Set while a queued capture holds `dump_in_progress`.
    deferral_pending: AtomicBool,
    time_reference: TimeReference,
    previous_driver: OnceLock<PreviousDriver>,
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("events", &self.events)
            .field("history", &self.history)
            .field("load_address", &self.load_address())
            .finish_non_exhaustive()
    }
}

impl Journal {
    /// A journal with the default collaborators.
    pub fn new(config: JournalConfig) -> Result<Self> {
        JournalBuilder::new(config).build()
    }

    pub fn builder(config: JournalConfig) -> JournalBuilder {
        JournalBuilder::new(config)
    }

    pub fn config(&self) -> &JournalConfig {
        &self.config
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn nocat_counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    pub fn time_reference(&self) -> TimeReference {
        self.time_reference
    }

    pub fn ticks_to_unix_micros(&self, ticks: u64) -> u64 {
        self.time_reference.ticks_to_unix_micros(ticks)
    }

    /// Sets the driver load address that assert reports are made relative to.
    pub fn init_device_cache(&self, load_address: u64) {
        self.load_address.store(load_address, Ordering::Relaxed);
    }

    pub fn load_address(&self) -> u64 {
        self.load_address.load(Ordering::Relaxed)
    }

    pub fn dump_in_progress(&self) -> bool {
        self.dump_in_progress.load(Ordering::Acquire)
    }

    fn common_record(&self, record_type: RecordType, device: Option<&DeviceContext>) -> CommonRecord {
        CommonRecord::new(
            record_type,
            device.map_or(0, |device| device.tag),
            self.clock.timestamp(),
            device.map_or(StateMask::empty(), |device| device.state),
        )
    }

    fn enter_state(&self) -> Result<GateGuard<'_, JournalState>> {
        self.state.try_enter().map_err(|Busy| {
            JournalStats::incr(&self.stats.ring_busy);
            JournalError::Busy
        })
    }

    fn enter_events(&self) -> Result<GateGuard<'_, EventLog>> {
        self.events.try_enter().map_err(|Busy| {
            JournalStats::incr(&self.stats.event_busy);
            JournalError::Busy
        })
    }

    fn arena_error(&self, record_type: RecordType, err: &JournalError) {
        if matches!(err, JournalError::Full { .. }) {
            JournalStats::incr(&self.stats.arena_full);
        }
        warn!(?record_type, error = %err, "failed to allocate arena record");
    }

    // ── Assertions ──────────────────────────────────────────────────────────

    /// Records an assertion and reports it to NOCAT.
    pub fn record_assert(&self, device: Option<&DeviceContext>, site: &AssertSite) -> AssertOutcome {
        self.record_assert_as(RecordType::Assert, device, site)
    }

    /// Records a debug breakpoint; folded and reported like an assertion.
    pub fn record_breakpoint(
        &self,
        device: Option<&DeviceContext>,
        site: &AssertSite,
    ) -> AssertOutcome {
        self.record_assert_as(RecordType::DbgBreakpoint, device, site)
    }

    fn record_assert_as(
        &self,
        record_type: RecordType,
        device: Option<&DeviceContext>,
        site: &AssertSite,
    ) -> AssertOutcome {
        let common = self.common_record(record_type, device);
        let template = AssertRecord {
            common,
            address_hint: site.address_hint,
            last_timestamp: common.timestamp,
            source_line: site.line,
            repeat_count: 1,
            level: site.level,
            _reserved: 0,
            call_stack: site.call_stack,
        };
        let unstored = AssertOutcome {
            record: template,
            is_new: true,
            stored: false,
        };

        let outcome = match self.enter_events() {
            Ok(mut events) => {
                let EventLog { arena, asserts } = &mut *events;
                match asserts.record(arena, record_type, &template, self.config.compress) {
                    Ok((record, is_new)) => {
                        if !is_new {
                            JournalStats::incr(&self.stats.asserts_folded);
                        }
                        AssertOutcome {
                            record,
                            is_new,
                            stored: true,
                        }
                    }
                    Err(err) => {
                        self.arena_error(record_type, &err);
                        unstored
                    }
                }
            }
            Err(_) => {
                debug!(address = site.address_hint, "assert recorded without dedup");
                unstored
            }
        };

        self.report_assert(device, &outcome.record);
        outcome
    }

    /// Forwards an assertion to NOCAT, folding it into the newest entry when
    /// that entry is the same assertion.
    fn report_assert(&self, device: Option<&DeviceContext>, record: &AssertRecord) {
        let load_address = self.load_address();
        let relative = |address: u64| address.wrapping_sub(load_address) as u32;

        let mut diag = AssertDiag {
            call_stack: [0; CALL_STACK_DEPTH],
            count: 1,
        };
        for (dst, src) in diag.call_stack.iter_mut().zip(&record.call_stack) {
            *dst = relative(*src);
        }
        let stack: AssertStack = diag.call_stack;

        if let Ok(mut state) = self.state.try_enter() {
            let JournalState { rings, nocat, .. } = &mut *state;
            if nocat.fold_repeated_assert(rings, &self.counters, &stack) {
                return;
            }
        }

        let error_code =
            u64::from(relative(record.address_hint)) | (u64::from(record.source_line) << 32);
        let params = NocatParams::new(NocatRecordType::Assert)
            .with_timestamp(record.common.timestamp)
            .with_error_code(error_code)
            .with_diag(diag.as_bytes());
        self.insert(&params, device, Some(&stack));
    }

    /// Assertion records tracked by the dedup index, oldest first.
    pub fn assert_records(&self) -> Result<Vec<AssertRecord>> {
        let events = self.enter_events()?;
        Ok(events.asserts.iter(&events.arena).copied().collect())
    }

    // ── NOCAT ───────────────────────────────────────────────────────────────

    /// Inserts a NOCAT entry and returns its id.
    ///
    /// Failures are only visible through [`Self::nocat_counters`].
    pub fn nocat_insert(
        &self,
        params: &NocatParams<'_>,
        device: Option<&DeviceContext>,
    ) -> Option<u32> {
        self.insert(params, device, None)
    }

    fn insert(
        &self,
        params: &NocatParams<'_>,
        device: Option<&DeviceContext>,
        assert_stack: Option<&AssertStack>,
    ) -> Option<u32> {
        let counters = &self.counters;
        counters.incr(NocatCounter::CollectReq);

        if params.record_type == NocatRecordType::Unknown {
            counters.incr(NocatCounter::BadParam);
            return None;
        }
        let timestamp = params.timestamp.unwrap_or_else(|| self.clock.timestamp());

        let id = match self.state.try_enter() {
            Ok(mut state) => {
                let JournalState { rings, nocat, .. } = &mut *state;
                if let Some(stack) = assert_stack {
                    nocat.remember_assert(stack);
                }
                if nocat.admit(params.record_type, timestamp, counters) {
                    nocat
                        .store(rings, counters, params, device, &*self.probe, timestamp)
                        .ok()
                } else {
                    None
                }
            }
            Err(Busy) => {
                counters.incr(NocatCounter::Busy);
                None
            }
        };

        self.notify(params.record_type, id);
        id
    }

    fn notify(&self, record_type: NocatRecordType, id: Option<u32>) {
        if self.dump_in_progress() {
            self.counters.incr(NocatCounter::NotificationFail);
            return;
        }
        self.counters.incr(NocatCounter::Notifications);
        debug!(
            tag = %self.config.nocat_tag,
            ?record_type,
            ?id,
            "NOCAT event"
        );
    }

    pub fn nocat_insert_bugcheck(&self, device: Option<&DeviceContext>, code: u32) -> Option<u32> {
        let params = NocatParams::new(NocatRecordType::Bugcheck)
            .with_source("OS")
            .with_bugcheck(code)
            .with_error_code(u64::from(code));
        self.insert(&params, device, None)
    }

    pub fn nocat_insert_engine_error(
        &self,
        device: Option<&DeviceContext>,
        source: &str,
        subsystem: u32,
        error_code: u64,
        diag: &[u8],
    ) -> Option<u32> {
        let params = NocatParams::new(NocatRecordType::Engine)
            .with_source(source)
            .with_subsystem(subsystem)
            .with_error_code(error_code)
            .with_diag(diag);
        self.insert(&params, device, None)
    }

    pub fn nocat_insert_tdr(
        &self,
        device: Option<&DeviceContext>,
        source: &str,
        subsystem: u32,
        error_code: u64,
        reason: u32,
        faulting_engine: Option<&str>,
    ) -> Option<u32> {
        let mut params = NocatParams::new(NocatRecordType::Tdr)
            .with_source(source)
            .with_subsystem(subsystem)
            .with_error_code(error_code)
            .with_tdr_reason(reason);
        params.faulting_engine = faulting_engine;
        self.insert(&params, device, None)
    }

    /// RC error entry; the source defaults to "RC Error".
    pub fn nocat_insert_rc_error(
        &self,
        device: Option<&DeviceContext>,
        source: Option<&str>,
        subsystem: u32,
        error_code: u64,
        diag: &[u8],
    ) -> Option<u32> {
        let mut params = NocatParams::new(NocatRecordType::Rc)
            .with_subsystem(subsystem)
            .with_error_code(error_code)
            .with_diag(diag);
        params.source = source;
        self.insert(&params, device, None)
    }

    /// Sets the reason of the newest TDR entry, or inserts a TDR entry with
    /// that reason if there is none.
    pub fn set_tdr_reason(
        &self,
        device: Option<&DeviceContext>,
        source: &str,
        subsystem: u32,
        error_code: u64,
        reason: u32,
    ) -> Option<u32> {
        self.counters.incr(NocatCounter::UpdateReq);

        {
            let Ok(mut state) = self.state.try_enter() else {
                self.counters.incr(NocatCounter::Busy);
                return None;
            };
            let JournalState { rings, nocat, .. } = &mut *state;
            if let Ok(mut entry) = nocat.newest_of_type(rings, &self.counters, NocatRecordType::Tdr)
            {
                write_cstr(&mut entry.record_mut().tdr_reason, TdrReason::describe(reason));
                self.counters.incr(NocatCounter::Updated);
                return Some(entry.id());
            }
        }

        self.nocat_insert_tdr(device, source, subsystem, error_code, reason, None)
    }

    /// Entries inserted but not yet reported.
    pub fn nocat_outstanding_count(&self) -> Result<u32> {
        let state = self.state.try_enter()?;
        Ok(state.nocat.outstanding())
    }

    /// Copies out the next unreported NOCAT entry.
    pub fn report_next_nocat_entry(&self) -> Result<NocatReport> {
        let mut state = self
            .state
            .try_enter()
            .inspect_err(|_| self.counters.incr(NocatCounter::Busy))?;
        let load_address = self.load_address();

        let JournalState { rings, nocat, .. } = &mut *state;
        let entry = nocat.report_next(rings, &self.counters)?;
        Ok(entry.to_report(load_address))
    }

    /// Looks up a NOCAT entry by id without moving the report cursor.
    pub fn nocat_entry(&self, id: u32, exact: bool) -> Result<NocatReport> {
        let mut state = self.enter_state()?;
        let load_address = self.load_address();

        let JournalState { rings, nocat, .. } = &mut *state;
        let entry = nocat.get_by_id(rings, &self.counters, id, exact)?;
        Ok(entry.to_report(load_address))
    }

    // ── Ring buffers ────────────────────────────────────────────────────────

    /// Adds `slots` of capacity to the ring for `record_type` on behalf of one
    /// more owner, creating the ring if needed.
    pub fn attach_ring_owner(&self, record_type: RecordType, slots: usize) -> Result<()> {
        let mut state = self.enter_state()?;
        state.rings.get_or_create(record_type, slots).map(|_| ())
    }

    /// Releases one owner's reference; returns the references left.
    pub fn detach_ring_owner(&self, record_type: RecordType) -> Result<u32> {
        let mut state = self.enter_state()?;
        state.rings.destroy(record_type)
    }

    /// Appends an `R` record to its ring buffer, creating the ring with the
    /// default number of slots on first use, and lets `fill` write the
    /// type-specific fields.
    ///
    /// NOCAT and RC diagnostic records carry their own bookkeeping and are
    /// refused here.
    pub fn append_ring_record<R: Record>(
        &self,
        device: Option<&DeviceContext>,
        fill: impl FnOnce(&mut R),
    ) -> Result<()> {
        if matches!(R::TYPE, RecordType::NocatReport | RecordType::RcDiagReport) {
            return Err(JournalError::InvalidArgument(
                "record type has a dedicated append path",
            ));
        }

        let common = self.common_record(R::TYPE, device);
        let mut state = self.enter_state()?;
        if state.rings.find(R::TYPE).is_none() {
            state
                .rings
                .get_or_create(R::TYPE, self.config.default_ring_entries)?;
        }

        let record = state.rings.append::<R>(&common).inspect_err(|err| {
            warn!(record_type = ?R::TYPE, error = %err, "failed to append ring record");
        })?;
        fill(record);
        Ok(())
    }

    pub fn add_power_state(
        &self,
        device: Option<&DeviceContext>,
        power_event: u32,
        power_state: u32,
        fast_boot_power_state: u32,
    ) -> Result<()> {
        self.append_ring_record::<PowerStateRecord>(device, |record| {
            record.power_event = power_event;
            record.state = power_state;
            record.fast_boot_power_state = fast_boot_power_state;
        })
    }

    // ── RC diagnostics ──────────────────────────────────────────────────────

    pub fn add_rc_diag(
        &self,
        device: Option<&DeviceContext>,
        report: &RcDiagReport<'_>,
    ) -> Result<u16> {
        let common = self.common_record(RecordType::RcDiagReport, device);
        let mut state = self.enter_state()?;
        let JournalState { rings, rc_diag, .. } = &mut *state;
        rc_diag.add(rings, &common, report).inspect_err(|err| {
            warn!(error = %err, "failed to add RC diagnostic report");
        })
    }

    /// Copy of the RC diagnostic record `idx`, subject to the owner and
    /// process filter.
    pub fn get_rc_diag(
        &self,
        idx: u16,
        owner: OwnerFilter,
        process: ProcessFilter,
    ) -> Result<RcDiagRecord> {
        let mut state = self.enter_state()?;
        let JournalState { rings, rc_diag, .. } = &mut *state;
        rc_diag.get(rings, idx, owner, process).map(|record| *record)
    }

    pub fn rc_diag_record_range(
        &self,
        owner: OwnerFilter,
        process: ProcessFilter,
    ) -> Result<(u16, u16)> {
        let state = self.enter_state()?;
        state.rc_diag.range(&state.rings, owner, process)
    }

    pub fn update_rc_diag_context(
        &self,
        start: u16,
        end: u16,
        process_id: u32,
        owner: u32,
    ) -> Result<()> {
        let mut state = self.enter_state()?;
        let JournalState { rings, rc_diag, .. } = &mut *state;
        rc_diag.update_context(rings, start, end, process_id, owner)
    }

    pub fn rc_diag_records_dropped(&self) -> Result<bool> {
        let state = self.enter_state()?;
        Ok(state.rc_diag.records_dropped())
    }

    // ── Arena ───────────────────────────────────────────────────────────────

    /// Records a bugcheck. It is counted even when it cannot be stored.
    pub fn add_bugcheck(&self, device: Option<&DeviceContext>, code: u32) -> Result<()> {
        JournalStats::incr(&self.stats.bugchecks);

        let record = BugcheckRecord {
            common: self.common_record(RecordType::BugCheck, device),
            bugcheck_code: code,
            _reserved: 0,
        };
        let mut events = self.enter_events()?;
        events
            .arena
            .allocate_record(RecordType::BugCheck, &record)
            .inspect_err(|err| self.arena_error(RecordType::BugCheck, err))?;
        Ok(())
    }

    /// Stores an engine dump with its payload and returns its arena offset.
    pub fn add_engine_dump(&self, device: Option<&DeviceContext>, payload: &[u8]) -> Result<usize> {
        let payload_len = u32::try_from(payload.len())
            .map_err(|_| JournalError::InvalidArgument("engine dump too large"))?;
        let record = EngineDumpRecord {
            common: self.common_record(RecordType::EngineDump, device),
            payload_len,
            _reserved: 0,
        };

        let mut events = self.enter_events()?;
        events
            .arena
            .allocate_with_payload(RecordType::EngineDump, &record, payload)
            .inspect_err(|err| self.arena_error(RecordType::EngineDump, err))
    }

    /// Opens an arena collection; later arena records join it until
    /// [`Self::end_collection`].
    pub fn begin_collection(&self, device: Option<&DeviceContext>) -> Result<usize> {
        let common = self.common_record(RecordType::Collection, device);
        let mut events = self.enter_events()?;
        events
            .arena
            .begin_collection(common)
            .inspect_err(|err| self.arena_error(RecordType::Collection, err))
    }

    pub fn end_collection(&self) -> Result<Option<usize>> {
        let mut events = self.enter_events()?;
        Ok(events.arena.end_collection())
    }

    // ── Dumps ───────────────────────────────────────────────────────────────

    /// Builds the time-ordered view of every record and hands it to `f`.
    ///
    /// All three gates are held while `f` runs.
    pub fn with_ordered_view<T>(
        &self,
        f: impl FnOnce(&OrderedView<'_>, &DumpHeader) -> T,
    ) -> Result<T> {
        let ctx = &*self.context;
        let wait = self.config.dump_wait;
        let timed_out = |_: &Busy| {
            JournalStats::incr(&self.stats.dump_busy);
            warn!(?wait, "timed out waiting for the journal");
        };

        let state = self.state.enter_with_retry(ctx, wait).inspect_err(timed_out)?;
        let events = self.events.enter_with_retry(ctx, wait).inspect_err(timed_out)?;
        let history = self.history.enter_with_retry(ctx, wait).inspect_err(timed_out)?;

        let view = OrderedView::build(&state.rings, &history, &events.arena);
        let header = DumpHeader {
            load_address: self.load_address(),
            timestamp_frequency: self.time_reference.frequency(),
            system_time_reference: self.time_reference.reference_micros(),
            record_count: u32::try_from(view.len()).unwrap_or(u32::MAX),
        };
        Ok(f(&view, &header))
    }

    /// Streams every record, oldest first, through `encoder`.
    #[instrument(skip_all)]
    pub fn dump<E: RecordEncoder>(&self, encoder: &mut E) -> Result<usize> {
        let written = self.with_ordered_view(|view, header| view.write_to(header, encoder))??;
        debug!(records = written, "journal dumped");
        Ok(written)
    }

    /// Takes an out-of-band dump of `device` and adds it to the error
    /// history.
    pub fn capture_device_dump(
        &self,
        device: &DeviceContext,
        producer: &mut dyn DumpProducer,
    ) -> Result<DumpOutcome> {
        self.capture(device, producer, false)
    }

    /// Runs a dump that [`Self::capture_device_dump`] had to defer.
    pub fn run_deferred_dump(
        &self,
        capture: DeferredCapture,
        producer: &mut dyn DumpProducer,
    ) -> Result<DumpOutcome> {
        self.capture(&capture.device, producer, true)
    }

    fn capture(
        &self,
        device: &DeviceContext,
        producer: &mut dyn DumpProducer,
        deferred: bool,
    ) -> Result<DumpOutcome> {
        // Only the retry of a queued capture inherits the in-progress flag.
        let owns_deferral = deferred && self.deferral_pending.swap(false, Ordering::AcqRel);
        if !owns_deferral && self.dump_in_progress.swap(true, Ordering::AcqRel) {
            return Err(JournalError::DumpInProgress);
        }

        let outcome = match producer.produce(device) {
            Ok(payload) => self.store_full_dump(device, payload),
            Err(ProduceError::WouldBlock) if !deferred => {
                self.deferral_pending.store(true, Ordering::Release);
                if self.deferred.queue(DeferredCapture { device: *device }) {
                    JournalStats::incr(&self.stats.deferred_dumps);
                    info!(device_tag = device.tag, "device dump deferred");
                    return Ok(DumpOutcome::Deferred);
                }
                self.deferral_pending.store(false, Ordering::Release);
                warn!(device_tag = device.tag, "could not defer device dump");
                Err(ProduceError::WouldBlock.into())
            }
            Err(err) => {
                warn!(device_tag = device.tag, error = %err, "device dump failed");
                Err(err.into())
            }
        };

        self.dump_in_progress.store(false, Ordering::Release);
        outcome
    }

    fn store_full_dump(&self, device: &DeviceContext, payload: Vec<u8>) -> Result<DumpOutcome> {
        let common = self.common_record(RecordType::FullDump, Some(device));
        let mut history = self
            .history
            .enter_with_retry(&*self.context, self.config.dump_wait)
            .inspect_err(|_| JournalStats::incr(&self.stats.dump_busy))?;

        debug!(device_tag = device.tag, len = payload.len(), "device dump stored");
        history.push(FullDump { common, payload });
        Ok(DumpOutcome::Stored)
    }

    /// Drops every full device dump and returns how many there were.
    pub fn clear_error_history(&self) -> Result<usize> {
        let mut history = self
            .history
            .enter_with_retry(&*self.context, self.config.dump_wait)
            .inspect_err(|_| JournalStats::incr(&self.stats.dump_busy))?;
        Ok(history.clear())
    }

    /// Full dumps currently held.
    pub fn error_history_len(&self) -> Result<usize> {
        let history = self.history.try_enter()?;
        Ok(history.len())
    }

    // ── Driver version ──────────────────────────────────────────────────────

    /// Swaps the stored driver identity for `current`. Only the first call
    /// touches the store; later calls return the same result.
    pub fn save_previous_driver_version(
        &self,
        store: &dyn VolatileStore,
        current: &DriverVersion,
    ) -> &PreviousDriver {
        self.previous_driver
            .get_or_init(|| save_previous_driver_version(store, current))
    }

    pub fn previous_driver(&self) -> Option<&PreviousDriver> {
        self.previous_driver.get()
    }
}
