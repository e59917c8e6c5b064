//! The `cas` transmat: wares are canonical tar bytes stored uncompressed
//! in a content-addressed pool.
//!
//! Storing the serialization uncompressed means a pool file's own bytes
//! hash directly to the ware's content id, so a pool can be audited (or
//! rebuilt) with nothing but a digest tool. Slots are sharded two levels
//! deep and writes are atomic temp-file + rename, so a crash never
//! leaves a torn blob at a final slot path.

use super::{Arena, Transmat};
use crate::constants::MAX_WARE_SIZE;
use crate::error::{Error, Result};
use crate::hashing::digest_str;
use crate::warehouse;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug)]
pub struct CasTransmat {
    stage: PathBuf,
}

impl CasTransmat {
    pub fn new(stage_root: PathBuf) -> Result<CasTransmat> {
        Ok(CasTransmat {
            stage: super::init_stage(stage_root)?,
        })
    }
}

impl Transmat for CasTransmat {
    fn kind(&self) -> &'static str {
        "cas"
    }

    fn materialize(&self, kind: &str, hash: &str, warehouses: &[String]) -> Result<Arena> {
        self.check_kind(kind)?;
        let addr = warehouse::resolve_read(warehouses, hash)?;
        let blob = super::fetch_blob(&addr, hash)?;
        if blob.len() > MAX_WARE_SIZE {
            return Err(Error::WareCorrupt {
                hash: hash.to_string(),
                msg: format!("blob exceeds size limit: {} bytes", blob.len()),
            });
        }

        let actual = digest_str(&blob);
        if actual != hash {
            return Err(Error::HashMismatch {
                expected: hash.to_string(),
                actual,
            });
        }

        let stage = tempfile::tempdir_in(&self.stage).map_err(Error::unknown)?;
        let tree = stage.path().join("tree");
        fs::create_dir(&tree).map_err(Error::unknown)?;
        super::tar::unpack_tree(&blob, &tree).map_err(|msg| Error::WareCorrupt {
            hash: hash.to_string(),
            msg,
        })?;

        info!(hash, uri = %addr.uri, "cas ware materialized");
        let kept = stage.into_path();
        Ok(Arena::with_scrap(kept.join("tree"), hash.to_string(), kept))
    }

    fn scan(&self, kind: &str, subject: &Path, warehouses: &[String]) -> Result<String> {
        self.check_kind(kind)?;
        let bytes = super::tar::pack_tree(subject)
            .map_err(|e| Error::unknown(format!("cannot pack {}: {e}", subject.display())))?;
        let hash = digest_str(&bytes);
        if !warehouses.is_empty() {
            warehouse::commit_all(warehouses, |addr| super::commit_blob(addr, &hash, &bytes))?;
        }
        Ok(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsutil;
    use tempfile::TempDir;

    #[test]
    fn scan_commit_materialize_round_trip() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("tree");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("greeting"), b"hello").unwrap();
        fsutil::set_mtime_nofollow(&root.join("greeting"), 1_262_304_000, 0).unwrap();
        fsutil::set_mtime_nofollow(&root, 1_262_304_000, 0).unwrap();

        let pool = tmp.path().join("pool");
        fs::create_dir(&pool).unwrap();
        let uri = format!("ca+file://{}", pool.display());
        let transmat = CasTransmat::new(tmp.path().join("stage")).unwrap();

        let hash = transmat.scan("cas", &root, &[uri.clone()]).unwrap();

        // The pool file's own bytes hash to the ware id.
        let slot = warehouse::pool_slot(&pool, &hash).unwrap();
        assert_eq!(digest_str(&fs::read(&slot).unwrap()), hash);

        let arena = transmat.materialize("cas", &hash, &[uri]).unwrap();
        assert_eq!(fs::read(arena.path().join("greeting")).unwrap(), b"hello");
    }

    #[test]
    fn tampered_blob_is_hash_mismatch() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("tree");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("f"), b"x").unwrap();

        let pool = tmp.path().join("pool");
        fs::create_dir(&pool).unwrap();
        let uri = format!("ca+file://{}", pool.display());
        let transmat = CasTransmat::new(tmp.path().join("stage")).unwrap();
        let hash = transmat.scan("cas", &root, &[uri.clone()]).unwrap();

        // Corrupt the slot in place.
        let slot = warehouse::pool_slot(&pool, &hash).unwrap();
        fs::write(&slot, b"tampered").unwrap();

        let err = transmat.materialize("cas", &hash, &[uri]).unwrap_err();
        assert_eq!(err.kind(), "ErrHashMismatch");

        // No arena left behind.
        assert_eq!(fs::read_dir(tmp.path().join("stage")).unwrap().count(), 0);
    }
}
