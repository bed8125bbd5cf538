//! Collaborator interfaces the journal is constructed with.
//!
//! The journal never touches hardware, OS time, work queues or persistent
//! storage directly. Each of those concerns is a small trait injected through
//! [`JournalBuilder`](crate::JournalBuilder), with an in-process implementation
//! suitable for tests and user-space embedders.

use crate::error::{ProduceError, StoreError};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use nix::time::{ClockId, clock_gettime};
use parking_lot::Mutex;
use rcdb_common::{HashMap, StateMask};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

// ── Devices ─────────────────────────────────────────────────────────────────

/// PCI identity of a device, copied into NOCAT entries.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub device_id: u32,
    pub vendor_id: u32,
    pub subsystem_vendor_id: u32,
    pub subsystem_id: u32,
    pub revision: u32,
}

/// The device a record is captured for.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct DeviceContext {
    pub tag: u32,
    pub state: StateMask,
    pub identity: DeviceIdentity,
}

impl DeviceContext {
    pub fn new(tag: u32) -> Self {
        Self {
            tag,
            ..Self::default()
        }
    }

    pub fn with_state(mut self, state: StateMask) -> Self {
        self.state = state;
        self
    }

    pub fn with_identity(mut self, identity: DeviceIdentity) -> Self {
        self.identity = identity;
        self
    }
}

/// Checks whether a device still answers register reads.
pub trait DeviceProbe: Send + Sync {
    fn is_device_reachable(&self, device_tag: u32) -> bool;
}

/// Probe that never reports a device as lost.
#[derive(Debug, Default, Copy, Clone)]
pub struct AssumeReachable;

impl DeviceProbe for AssumeReachable {
    fn is_device_reachable(&self, _device_tag: u32) -> bool {
        true
    }
}

// ── Time ────────────────────────────────────────────────────────────────────

/// Source of record timestamps.
pub trait Clock: Send + Sync {
    /// Monotonic tick counter.
    fn timestamp(&self) -> u64;

    /// Ticks per second.
    fn frequency(&self) -> u64;

    /// Wall-clock time in microseconds since the Unix epoch.
    fn wallclock_micros(&self) -> u64;
}

/// `CLOCK_MONOTONIC` in nanoseconds.
#[derive(Debug, Default, Copy, Clone)]
pub struct MonotonicClock;

const NANOS_PER_SEC: u64 = 1_000_000_000;

fn read_clock(id: ClockId) -> Option<(u64, u64)> {
    let ts = clock_gettime(id).ok()?;
    Some((u64::try_from(ts.tv_sec()).ok()?, u64::try_from(ts.tv_nsec()).ok()?))
}

impl Clock for MonotonicClock {
    fn timestamp(&self) -> u64 {
        read_clock(ClockId::CLOCK_MONOTONIC)
            .map(|(secs, nanos)| secs * NANOS_PER_SEC + nanos)
            .unwrap_or(0)
    }

    fn frequency(&self) -> u64 {
        NANOS_PER_SEC
    }

    fn wallclock_micros(&self) -> u64 {
        read_clock(ClockId::CLOCK_REALTIME)
            .map(|(secs, nanos)| secs * 1_000_000 + nanos / 1_000)
            .unwrap_or(0)
    }
}

/// Clock driven by hand, for tests and replay.
#[derive(Debug)]
pub struct ManualClock {
    ticks: AtomicU64,
    frequency: u64,
    wallclock_micros: u64,
}

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self {
            ticks: AtomicU64::new(start),
            frequency: NANOS_PER_SEC,
            wallclock_micros: 0,
        }
    }

    pub fn with_frequency(mut self, frequency: u64) -> Self {
        self.frequency = frequency;
        self
    }

    pub fn with_wallclock_micros(mut self, micros: u64) -> Self {
        self.wallclock_micros = micros;
        self
    }

    pub fn set(&self, ticks: u64) {
        self.ticks.store(ticks, Ordering::Relaxed);
    }

    /// Advances the clock and returns the new tick value.
    pub fn advance(&self, ticks: u64) -> u64 {
        self.ticks.fetch_add(ticks, Ordering::Relaxed) + ticks
    }
}

impl Clock for ManualClock {
    fn timestamp(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    fn frequency(&self) -> u64 {
        self.frequency
    }

    fn wallclock_micros(&self) -> u64 {
        self.wallclock_micros
    }
}

// ── Execution context ───────────────────────────────────────────────────────

/// Tells the journal whether the calling context may wait.
pub trait ExecutionContext: Send + Sync {
    fn can_block(&self) -> bool;
}

/// Ordinary thread context.
#[derive(Debug, Default, Copy, Clone)]
pub struct AnyContext;

impl ExecutionContext for AnyContext {
    fn can_block(&self) -> bool {
        true
    }
}

/// Interrupt or crash context: every busy gate is final.
#[derive(Debug, Default, Copy, Clone)]
pub struct AtomicContext;

impl ExecutionContext for AtomicContext {
    fn can_block(&self) -> bool {
        false
    }
}

// ── Deferred work ───────────────────────────────────────────────────────────

/// A device dump that could not be taken in its original context.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DeferredCapture {
    pub device: DeviceContext,
}

/// Schedules work to run later from a context that may block.
pub trait DeferredWork: Send + Sync {
    /// Returns `false` if the work could not be scheduled.
    fn queue(&self, capture: DeferredCapture) -> bool;
}

/// Rejects every request.
#[derive(Debug, Default, Copy, Clone)]
pub struct NoDeferredWork;

impl DeferredWork for NoDeferredWork {
    fn queue(&self, _capture: DeferredCapture) -> bool {
        false
    }
}

/// Hands deferred captures to a worker over a bounded channel.
#[derive(Debug, Clone)]
pub struct ChannelWorkQueue {
    tx: Sender<DeferredCapture>,
}

impl ChannelWorkQueue {
    pub fn new(capacity: usize) -> (Self, Receiver<DeferredCapture>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        (Self { tx }, rx)
    }
}

impl DeferredWork for ChannelWorkQueue {
    fn queue(&self, capture: DeferredCapture) -> bool {
        match self.tx.try_send(capture) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(device_tag = capture.device.tag, "deferred work queue is full");
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!(device_tag = capture.device.tag, "deferred work queue is closed");
                false
            }
        }
    }
}

// ── Volatile store ──────────────────────────────────────────────────────────

/// Key-value storage that survives driver reloads but not reboots.
pub trait VolatileStore: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn write(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VolatileStore for MemoryStore {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.values.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

/// Platform without a volatile store.
#[derive(Debug, Default, Copy, Clone)]
pub struct UnsupportedStore;

impl VolatileStore for UnsupportedStore {
    fn read(&self, _key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Err(StoreError::NotSupported)
    }

    fn write(&self, _key: &str, _value: &[u8]) -> Result<(), StoreError> {
        Err(StoreError::NotSupported)
    }
}

// ── Dump producer ───────────────────────────────────────────────────────────

/// Produces the payload of an out-of-band device dump.
pub trait DumpProducer {
    fn produce(&mut self, device: &DeviceContext) -> Result<Vec<u8>, ProduceError>;
}

impl<F> DumpProducer for F
where
    F: FnMut(&DeviceContext) -> Result<Vec<u8>, ProduceError>,
{
    fn produce(&mut self, device: &DeviceContext) -> Result<Vec<u8>, ProduceError> {
        self(device)
    }
}
