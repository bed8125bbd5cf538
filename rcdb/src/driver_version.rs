//! Record of the driver that ran before this one.
//!
//! The current version is written to the volatile store on every load, so
//! the next load can report what it replaced and how many loads happened
//! since boot.

use crate::collab::VolatileStore;
use crate::error::StoreError;
use serde::Serialize;
use tracing::{debug, warn};

pub const KEY_VERSION: &str = "prev_driver_version";
pub const KEY_BRANCH: &str = "prev_driver_branch";
pub const KEY_CHANGELIST: &str = "prev_driver_changelist";
pub const KEY_LOAD_COUNT: &str = "prev_driver_load_count";

/// Identity of the running driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriverVersion {
    pub version: String,
    pub branch: String,
    pub changelist: u32,
}

/// What the store said about the previous driver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PreviousDriver {
    pub version: Option<String>,
    pub branch: Option<String>,
    pub changelist: Option<u32>,
    /// Loads since boot, this one included.
    pub load_count: u32,
    /// Whether the platform has a volatile store at all.
    pub supported: bool,
    /// First read failure; the current version is written regardless.
    #[serde(skip)]
    pub read_error: Option<StoreError>,
}

impl PreviousDriver {
    /// The previous driver is worth reporting only after a reload.
    pub fn is_reload(&self) -> bool {
        self.load_count > 1
    }
}

/// Reads the previous driver's identity and replaces it with `current`.
pub fn save_previous_driver_version(
    store: &dyn VolatileStore,
    current: &DriverVersion,
) -> PreviousDriver {
    let mut previous = PreviousDriver {
        supported: true,
        ..PreviousDriver::default()
    };

    let mut load_count = 0;
    match read_previous(store, &mut previous, &mut load_count) {
        Ok(()) => {}
        Err(StoreError::NotSupported) => {
            debug!("volatile store not supported, skipping driver version");
            previous.supported = false;
            return previous;
        }
        Err(err) => {
            warn!(error = %err, "failed to read previous driver version");
            previous.read_error = Some(err);
        }
    }

    previous.load_count = load_count.wrapping_add(1);
    let writes = [
        (KEY_VERSION, current.version.as_bytes().to_vec()),
        (KEY_BRANCH, current.branch.as_bytes().to_vec()),
        (KEY_CHANGELIST, current.changelist.to_le_bytes().to_vec()),
        (KEY_LOAD_COUNT, previous.load_count.to_le_bytes().to_vec()),
    ];
    for (key, value) in writes {
        if let Err(err) = store.write(key, &value) {
            warn!(key, error = %err, "failed to write driver version");
        }
    }

    previous
}

fn read_previous(
    store: &dyn VolatileStore,
    previous: &mut PreviousDriver,
    load_count: &mut u32,
) -> Result<(), StoreError> {
    let Some(version) = store.read(KEY_VERSION)? else {
        return Ok(());
    };
    if version.is_empty() {
        return Ok(());
    }
    previous.version = Some(decode_str(KEY_VERSION, version)?);

    let branch = store.read(KEY_BRANCH)?.unwrap_or_default();
    if branch.is_empty() {
        return Err(StoreError::BadSize {
            key: KEY_BRANCH.to_string(),
            len: 0,
        });
    }
    previous.branch = Some(decode_str(KEY_BRANCH, branch)?);

    previous.changelist = Some(decode_u32(KEY_CHANGELIST, store.read(KEY_CHANGELIST)?)?);
    *load_count = decode_u32(KEY_LOAD_COUNT, store.read(KEY_LOAD_COUNT)?)?;
    Ok(())
}

fn decode_str(key: &str, mut bytes: Vec<u8>) -> Result<String, StoreError> {
    while bytes.last() == Some(&0) {
        bytes.pop();
    }
    String::from_utf8(bytes).map_err(|_| StoreError::InvalidUtf8 {
        key: key.to_string(),
    })
}

fn decode_u32(key: &str, bytes: Option<Vec<u8>>) -> Result<u32, StoreError> {
    let bytes = bytes.unwrap_or_default();
    let raw: [u8; 4] = bytes.as_slice().try_into().map_err(|_| StoreError::BadSize {
        key: key.to_string(),
        len: bytes.len(),
    })?;
    Ok(u32::from_le_bytes(raw))
}
