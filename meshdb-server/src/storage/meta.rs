//! Meta store: node UUID and storage format version.
//!
//! Lives under `<root>/metainf/`. The UUID is generated once on first open
//! and is the node's identity for its whole life; the version guards
//! against opening a storage root written by an incompatible build.

use std::path::Path;

use uuid::Uuid;

use super::{Db, ensure_map, map_get, map_put};
use crate::error::{Error, Result};

/// Current storage format version.
pub const STORAGE_VERSION: u32 = 1;

const KEY_UUID: i64 = 0;
const KEY_VERSION: i64 = 1;

/// Meta information loaded at startup.
#[derive(Debug, Clone, Copy)]
pub struct MetaInfo {
    pub uuid: Uuid,
    pub version: u32,
}

impl MetaInfo {
    /// Open the meta store, generating identity on first use and flushing
    /// it back so the next start sees the same values.
    pub fn open(root: &Path) -> Result<MetaInfo> {
        let db = Db::open(root.join("metainf").join("meta.db"))?;

        let info = db.with_tx(|tx| {
            ensure_map(tx, "metainf")?;

            let uuid = match map_get(tx, "metainf", KEY_UUID)? {
                Some(raw) if raw.len() == 16 => {
                    let mut bytes = [0u8; 16];
                    bytes.copy_from_slice(&raw);
                    Uuid::from_bytes(bytes)
                }
                _ => {
                    let fresh = Uuid::new_v4();
                    map_put(tx, "metainf", KEY_UUID, fresh.as_bytes())?;
                    fresh
                }
            };

            let version = match map_get(tx, "metainf", KEY_VERSION)? {
                Some(raw) if raw.len() == 4 => {
                    u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])
                }
                _ => {
                    map_put(tx, "metainf", KEY_VERSION, &STORAGE_VERSION.to_le_bytes())?;
                    STORAGE_VERSION
                }
            };

            Ok(MetaInfo { uuid, version })
        })?;

        if info.version != STORAGE_VERSION {
            return Err(Error::failed(format!(
                "storage version {} does not match supported version {}",
                info.version, STORAGE_VERSION
            )));
        }

        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();

        let first = MetaInfo::open(dir.path()).unwrap();
        assert_eq!(first.version, STORAGE_VERSION);
        assert!(!first.uuid.is_nil());

        let second = MetaInfo::open(dir.path()).unwrap();
        assert_eq!(second.uuid, first.uuid);
    }
}
