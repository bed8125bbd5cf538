use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Producer group stamped into every record header.
///
/// The arena only ever holds [`RecordGroup::Rm`] records; anything else found
/// while walking it means the stream is no longer trustworthy.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum RecordGroup {
    Unknown = 0,
    Rm = 1,
}

impl RecordGroup {
    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Unknown),
            1 => Some(Self::Rm),
            _ => None,
        }
    }
}

/// Record kinds held by the arena, the ring buffers and the full-dump list.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum RecordType {
    /// Assertion failure (arena, deduplicated)
    Assert = 1,
    /// Release-build debug breakpoint (arena, deduplicated)
    DbgBreakpoint = 2,
    /// Bugcheck marker (arena)
    BugCheck = 3,
    /// Variable-length engine state blob (arena)
    EngineDump = 4,
    /// Grouping header spanning the records allocated after it (arena)
    Collection = 5,
    /// Power transition (ring)
    PowerState = 6,
    /// RC error diagnostic report (ring)
    RcDiagReport = 7,
    /// NOCAT telemetry entry (ring)
    NocatReport = 8,
    /// Out-of-band device dump (full-dump side list)
    FullDump = 9,
}

impl RecordType {
    pub const ALL: [RecordType; 9] = [
        RecordType::Assert,
        RecordType::DbgBreakpoint,
        RecordType::BugCheck,
        RecordType::EngineDump,
        RecordType::Collection,
        RecordType::PowerState,
        RecordType::RcDiagReport,
        RecordType::NocatReport,
        RecordType::FullDump,
    ];

    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Assert),
            2 => Some(Self::DbgBreakpoint),
            3 => Some(Self::BugCheck),
            4 => Some(Self::EngineDump),
            5 => Some(Self::Collection),
            6 => Some(Self::PowerState),
            7 => Some(Self::RcDiagReport),
            8 => Some(Self::NocatReport),
            9 => Some(Self::FullDump),
            _ => None,
        }
    }

    pub const fn as_raw(self) -> u8 {
        self as u8
    }
}

/// Class of a NOCAT telemetry entry.
///
/// `Bugcheck` and `Tdr` are priority classes: inserting one locks the NOCAT
/// journal so that the entries leading up to it cannot be wrapped over before
/// they are reported.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum NocatRecordType {
    Unknown = 0,
    Bugcheck = 1,
    Engine = 2,
    Tdr = 3,
    Rc = 4,
    Assert = 5,
}

impl NocatRecordType {
    /// Slot of the "any type" bookkeeping entry in per-type tables.
    pub const ANY_SLOT: usize = 6;

    /// Number of per-type table slots, including [`Self::ANY_SLOT`].
    pub const SLOTS: usize = 7;

    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Unknown),
            1 => Some(Self::Bugcheck),
            2 => Some(Self::Engine),
            3 => Some(Self::Tdr),
            4 => Some(Self::Rc),
            5 => Some(Self::Assert),
            _ => None,
        }
    }

    pub const fn slot(self) -> usize {
        self as usize
    }

    pub const fn is_priority(self) -> bool {
        matches!(self, Self::Bugcheck | Self::Tdr)
    }

    /// Whether capturing this class probes the device for reachability.
    pub const fn probes_device(self) -> bool {
        matches!(self, Self::Bugcheck | Self::Rc)
    }

    /// Source string used when the producer does not supply one.
    pub const fn default_source(self) -> Option<&'static str> {
        match self {
            Self::Rc => Some("RC Error"),
            Self::Assert => Some("ASSERT"),
            _ => None,
        }
    }
}

/// Reason attached to a timeout-detection-and-recovery entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum TdrReason {
    None = 0,
    Legacy = 1,
    FullChip = 2,
    BusReset = 3,
    Gc6Reset = 4,
    SurpriseRemoval = 5,
    UcodeReset = 6,
}

impl TdrReason {
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::None),
            1 => Some(Self::Legacy),
            2 => Some(Self::FullChip),
            3 => Some(Self::BusReset),
            4 => Some(Self::Gc6Reset),
            5 => Some(Self::SurpriseRemoval),
            6 => Some(Self::UcodeReset),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "N/A",
            Self::Legacy => "LEGACY",
            Self::FullChip => "FULLCHIP",
            Self::BusReset => "BUSRESET",
            Self::Gc6Reset => "GC6_RESET",
            Self::SurpriseRemoval => "SURPRISE_REMOVAL",
            Self::UcodeReset => "UCODE_RESET",
        }
    }

    /// Label for a raw reason code; unknown codes map to `"Unknown"`.
    pub const fn describe(code: u32) -> &'static str {
        match Self::from_code(code) {
            Some(reason) => reason.as_str(),
            None => "Unknown",
        }
    }
}

bitflags! {
    /// Device power, reset and loss state captured with every record.
    ///
    /// The low nibble holds the GC6 power state as a number rather than a flag.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct StateMask: u64 {
        const GC6_STATE = 0xF;
        const NOT_FULL_POWER = 1 << 4;
        const NOT_CONNECTED = 1 << 5;
        const IN_STANDBY = 1 << 6;
        const IN_HIBERNATE = 1 << 7;
        const IN_PM_CODEPATH = 1 << 8;
        const IN_GC6_RESET = 1 << 9;
        const IN_FULLCHIP_RESET = 1 << 10;
        const IN_SEC_BUS_RESET = 1 << 11;
        const IN_TIMEOUT_RECOVERY = 1 << 12;
        const IS_LOST = 1 << 13;
        const VIDMEM_FAILED_BAR0 = 1 << 14;
        const VIDMEM_FAILED_BAR2 = 1 << 15;
    }
}

impl StateMask {
    /// Both BAR checks are marked because the probe cannot tell which one failed.
    pub const VIDMEM_FAILED: StateMask =
        StateMask::VIDMEM_FAILED_BAR0.union(StateMask::VIDMEM_FAILED_BAR2);

    pub fn with_gc6_state(self, state: u8) -> Self {
        let bits = (self.bits() & !Self::GC6_STATE.bits()) | (u64::from(state) & 0xF);
        Self::from_bits_retain(bits)
    }

    pub fn gc6_state(self) -> u8 {
        (self.bits() & Self::GC6_STATE.bits()) as u8
    }

    /// Whether the device was in any reset or recovery path.
    pub fn in_reset(self) -> bool {
        self.intersects(
            Self::IN_GC6_RESET
                | Self::IN_FULLCHIP_RESET
                | Self::IN_SEC_BUS_RESET
                | Self::IN_TIMEOUT_RECOVERY,
        )
    }
}
