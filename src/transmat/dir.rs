//! The `dir` transmat: wares are plain directory trees.
//!
//! A `file://` warehouse addresses one tree directly; a `ca+file://`
//! warehouse holds trees in pool slots keyed by hash. The content id is
//! a digest over a canonical serialization of the tree: depth-first,
//! sorted siblings, covering each node's path, type, permission bits,
//! ownership, mtime, and content (file bytes or symlink target).
//!
//! Because ownership and mtime are part of the id, callers who want
//! stable hashes across hosts pair this kind with filters; unspecified
//! filter fields already force the engine defaults.

use super::{Arena, Transmat};
use crate::error::{Error, Result};
use crate::fsutil;
use crate::hashing::digest_str;
use crate::warehouse::{self, Flavor, WarehouseAddr};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Read};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug)]
pub struct DirTransmat {
    stage: PathBuf,
}

impl DirTransmat {
    pub fn new(stage_root: PathBuf) -> Result<DirTransmat> {
        Ok(DirTransmat {
            stage: super::init_stage(stage_root)?,
        })
    }
}

impl Transmat for DirTransmat {
    fn kind(&self) -> &'static str {
        "dir"
    }

    fn materialize(&self, kind: &str, hash: &str, warehouses: &[String]) -> Result<Arena> {
        self.check_kind(kind)?;
        let addr = warehouse::resolve_read(warehouses, hash)?;
        let source = addr.ware_location(hash).ok_or_else(|| Error::WareDne {
            hash: hash.to_string(),
        })?;
        if !source.is_dir() {
            return Err(Error::WareDne {
                hash: hash.to_string(),
            });
        }

        // Stage under a temp dir so failure leaves nothing behind.
        let stage = tempfile::tempdir_in(&self.stage).map_err(Error::unknown)?;
        let tree = stage.path().join("tree");
        fsutil::copy_tree(&source, &tree).map_err(|e| Error::WareCorrupt {
            hash: hash.to_string(),
            msg: e.to_string(),
        })?;

        let actual = scan_tree(&tree).map_err(|e| Error::WareCorrupt {
            hash: hash.to_string(),
            msg: e.to_string(),
        })?;
        if actual != hash {
            return Err(Error::HashMismatch {
                expected: hash.to_string(),
                actual,
            });
        }

        info!(hash, uri = %addr.uri, "dir ware materialized");
        let kept = stage.into_path();
        Ok(Arena::with_scrap(kept.join("tree"), hash.to_string(), kept))
    }

    fn scan(&self, kind: &str, subject: &Path, warehouses: &[String]) -> Result<String> {
        self.check_kind(kind)?;
        let hash = scan_tree(subject).map_err(|e| Error::unknown(format!(
            "cannot scan {}: {e}",
            subject.display()
        )))?;
        if !warehouses.is_empty() {
            warehouse::commit_all(warehouses, |addr| commit_tree(addr, &hash, subject))?;
        }
        Ok(hash)
    }
}

fn commit_tree(addr: &WarehouseAddr, hash: &str, subject: &Path) -> Result<()> {
    let target = addr
        .ware_location(hash)
        .ok_or_else(|| Error::unknown(format!("hash {hash:?} cannot address a pool slot")))?;
    if addr.flavor == Flavor::ContentAddressed && target.exists() {
        return Ok(());
    }
    if target.exists() {
        // Direct warehouses are replaced wholesale; a half-old tree is
        // worse than a moment of absence.
        fsutil::remove_tree(&target).map_err(|e| Error::WarehouseProblem {
            msg: e.to_string(),
            uris: vec![addr.uri.clone()],
        })?;
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::WarehouseProblem {
            msg: e.to_string(),
            uris: vec![addr.uri.clone()],
        })?;
    }
    fsutil::copy_tree(subject, &target).map_err(|e| Error::WarehouseProblem {
        msg: e.to_string(),
        uris: vec![addr.uri.clone()],
    })
}

// =============================================================================
// Canonical tree hashing
// =============================================================================

/// Hashes a tree in canonical order. Stable across re-scans of
/// bit-identical trees, and any metadata or content change within the
/// tracked attribute set changes the result.
pub fn scan_tree(root: &Path) -> io::Result<String> {
    let mut hasher = Sha256::new();
    hash_node(&mut hasher, root, Path::new("."))?;
    Ok(digest_str(hasher.finalize().as_slice()))
}

fn hash_node(hasher: &mut Sha256, full: &Path, rel: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(full)?;
    let ftype = meta.file_type();

    let type_tag = if ftype.is_dir() {
        b'd'
    } else if ftype.is_symlink() {
        b'l'
    } else {
        b'f'
    };

    hasher.update(rel.as_os_str().as_encoded_bytes());
    hasher.update([0, type_tag, 0]);
    hasher.update(
        format!(
            "{:o}\0{}\0{}\0{}.{}\0",
            meta.mode() & 0o7777,
            meta.uid(),
            meta.gid(),
            meta.mtime(),
            meta.mtime_nsec()
        )
        .as_bytes(),
    );

    if ftype.is_dir() {
        hasher.update([b'\n']);
        for entry in fsutil::sorted_entries(full)? {
            hash_node(hasher, &entry.path(), &rel.join(entry.file_name()))?;
        }
    } else if ftype.is_symlink() {
        hasher.update(fs::read_link(full)?.as_os_str().as_encoded_bytes());
        hasher.update([b'\n']);
    } else {
        // Stream file contents; a nested digest keeps records framed
        // without buffering whole files.
        let mut file = fs::File::open(full)?;
        let mut content = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            content.update(&buf[..n]);
        }
        hasher.update(content.finalize());
        hasher.update([b'\n']);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fixture(tmp: &TempDir, name: &str) -> PathBuf {
        let root = tmp.path().join(name);
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("a"), b"alpha").unwrap();
        fs::write(root.join("sub/b"), b"beta").unwrap();
        for p in [root.join("a"), root.join("sub/b"), root.join("sub"), root.clone()] {
            fsutil::set_mtime_nofollow(&p, 1_262_304_000, 0).unwrap();
        }
        root
    }

    #[test]
    fn scan_is_stable() {
        let tmp = TempDir::new().unwrap();
        let root = fixture(&tmp, "tree");
        assert_eq!(scan_tree(&root).unwrap(), scan_tree(&root).unwrap());
    }

    #[test]
    fn content_change_changes_hash() {
        let tmp = TempDir::new().unwrap();
        let root = fixture(&tmp, "tree");
        let before = scan_tree(&root).unwrap();
        fs::write(root.join("a"), b"ALPHA").unwrap();
        fsutil::set_mtime_nofollow(&root.join("a"), 1_262_304_000, 0).unwrap();
        assert_ne!(before, scan_tree(&root).unwrap());
    }

    #[test]
    fn mtime_change_changes_hash() {
        let tmp = TempDir::new().unwrap();
        let root = fixture(&tmp, "tree");
        let before = scan_tree(&root).unwrap();
        fsutil::set_mtime_nofollow(&root.join("a"), 1_262_304_001, 0).unwrap();
        assert_ne!(before, scan_tree(&root).unwrap());
    }

    #[test]
    fn materialize_round_trip() {
        let tmp = TempDir::new().unwrap();
        let root = fixture(&tmp, "ware");
        let hash = scan_tree(&root).unwrap();
        let transmat = DirTransmat::new(tmp.path().join("stage")).unwrap();
        let uri = format!("file://{}", root.display());

        let arena = transmat.materialize("dir", &hash, &[uri]).unwrap();
        assert_eq!(scan_tree(arena.path()).unwrap(), hash);
        assert_eq!(arena.hash(), hash);
    }

    #[test]
    fn materialize_detects_mismatch_and_cleans_up() {
        let tmp = TempDir::new().unwrap();
        let root = fixture(&tmp, "ware");
        let transmat = DirTransmat::new(tmp.path().join("stage")).unwrap();
        let uri = format!("file://{}", root.display());

        let err = transmat
            .materialize("dir", "sha256:0000000000000000000000000000000000000000000000000000000000000000", &[uri])
            .unwrap_err();
        assert_eq!(err.kind(), "ErrHashMismatch");

        // The staging area must hold no leftover arena.
        let leftovers = fs::read_dir(tmp.path().join("stage")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn materialize_missing_ware_is_dne() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("pool")).unwrap();
        let transmat = DirTransmat::new(tmp.path().join("stage")).unwrap();
        let uri = format!("ca+file://{}", tmp.path().join("pool").display());
        let err = transmat
            .materialize("dir", "sha256:abcdef0123", &[uri])
            .unwrap_err();
        assert_eq!(err.kind(), "ErrWareDNE");
    }

    #[test]
    fn scan_commits_to_pool() {
        let tmp = TempDir::new().unwrap();
        let root = fixture(&tmp, "out");
        let pool = tmp.path().join("pool");
        fs::create_dir(&pool).unwrap();
        let transmat = DirTransmat::new(tmp.path().join("stage")).unwrap();
        let uri = format!("ca+file://{}", pool.display());

        let hash = transmat.scan("dir", &root, &[uri.clone()]).unwrap();
        let slot = warehouse::pool_slot(&pool, &hash).unwrap();
        assert!(slot.is_dir());

        // And the committed tree materializes back to the same hash.
        let arena = transmat.materialize("dir", &hash, &[uri]).unwrap();
        assert_eq!(arena.hash(), hash);
    }
}
