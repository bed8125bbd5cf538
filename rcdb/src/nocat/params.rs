use crate::collab::DeviceIdentity;
use crate::record::{AssertDiag, NocatRecord, read_cstr};
use rcdb_common::NocatRecordType;
use serde::Serialize;
use zerocopy::FromBytes;

/// Description of a NOCAT entry to insert.
///
/// Unset strings fall back to per-type defaults; `diag` is cut to the entry's
/// diagnostic buffer capacity.
#[derive(Debug, Clone)]
pub struct NocatParams<'a> {
    pub record_type: NocatRecordType,
    /// Capture time; the journal clock is read when unset.
    pub timestamp: Option<u64>,
    pub source: Option<&'a str>,
    pub subsystem: u32,
    pub error_code: u64,
    pub bugcheck: u32,
    pub faulting_engine: Option<&'a str>,
    pub tdr_reason: u32,
    pub diag: &'a [u8],
}

impl<'a> NocatParams<'a> {
    pub fn new(record_type: NocatRecordType) -> Self {
        Self {
            record_type,
            timestamp: None,
            source: None,
            subsystem: 0,
            error_code: 0,
            bugcheck: 0,
            faulting_engine: None,
            tdr_reason: 0,
            diag: &[],
        }
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_source(mut self, source: &'a str) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_subsystem(mut self, subsystem: u32) -> Self {
        self.subsystem = subsystem;
        self
    }

    pub fn with_error_code(mut self, error_code: u64) -> Self {
        self.error_code = error_code;
        self
    }

    pub fn with_bugcheck(mut self, bugcheck: u32) -> Self {
        self.bugcheck = bugcheck;
        self
    }

    pub fn with_faulting_engine(mut self, engine: &'a str) -> Self {
        self.faulting_engine = Some(engine);
        self
    }

    pub fn with_tdr_reason(mut self, reason: u32) -> Self {
        self.tdr_reason = reason;
        self
    }

    pub fn with_diag(mut self, diag: &'a [u8]) -> Self {
        self.diag = diag;
        self
    }
}

/// Owned copy of a NOCAT entry, as handed to the reporter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NocatReport {
    pub id: u32,
    pub record_type: NocatRecordType,
    pub timestamp: u64,
    pub device_tag: u32,
    pub state_mask: u64,
    pub device: Option<DeviceIdentity>,
    pub source: String,
    pub subsystem: u32,
    pub error_code: u64,
    pub bugcheck: u32,
    pub faulting_engine: String,
    pub tdr_reason: String,
    pub diag: Vec<u8>,
    /// Driver load address assert offsets are relative to.
    pub load_address: u64,
}

impl NocatReport {
    pub fn from_record(record: &NocatRecord, load_address: u64) -> Self {
        let device = (record.device_state.valid != 0).then(|| DeviceIdentity {
            device_id: record.device_state.device_id,
            vendor_id: record.device_state.vendor_id,
            subsystem_vendor_id: record.device_state.subsystem_vendor_id,
            subsystem_id: record.device_state.subsystem_id,
            revision: record.device_state.revision,
        });

        Self {
            id: record.id,
            record_type: NocatRecordType::from_raw(record.record_type)
                .unwrap_or(NocatRecordType::Unknown),
            timestamp: record.common.timestamp,
            device_tag: record.common.device_tag,
            state_mask: record.common.state_mask,
            device,
            source: read_cstr(&record.source),
            subsystem: record.subsystem,
            error_code: record.error_code,
            bugcheck: record.bugcheck,
            faulting_engine: read_cstr(&record.faulting_engine),
            tdr_reason: read_cstr(&record.tdr_reason),
            diag: record.diag().to_vec(),
            load_address,
        }
    }

    /// Decoded payload of an ASSERT entry.
    pub fn assert_diag(&self) -> Option<AssertDiag> {
        if self.record_type != NocatRecordType::Assert {
            return None;
        }
        AssertDiag::read_from_prefix(&self.diag)
            .ok()
            .map(|(diag, _)| diag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        let diag = [1u8, 2, 3];
        let params = NocatParams::new(NocatRecordType::Engine)
            .with_timestamp(9)
            .with_source("GR")
            .with_subsystem(4)
            .with_error_code(0xdead)
            .with_faulting_engine("ce0")
            .with_diag(&diag);

        assert_eq!(params.timestamp, Some(9));
        assert_eq!(params.source, Some("GR"));
        assert_eq!(params.faulting_engine, Some("ce0"));
        assert_eq!(params.error_code, 0xdead);
        assert_eq!(params.diag, &diag);
        assert_eq!(params.tdr_reason, 0);
    }
}
