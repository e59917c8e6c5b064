//! The `tar` transmat: wares are gzip-compressed canonical tar streams.
//!
//! The content id is the SHA-256 of the *uncompressed* tar bytes, so a
//! ware's identity does not depend on compression level or gzip
//! metadata. Packing walks the tree depth-first with sorted siblings
//! and records mode, ownership, and mtime, so bit-identical trees pack
//! to bit-identical archives.
//!
//! Unpacking is a security boundary: a hostile warehouse can hand us an
//! archive that tries to escape the staging directory. Every entry is
//! validated before extraction, cumulative size and entry counts are
//! bounded, and link targets may not point outside the tree.

use super::{Arena, Transmat};
use crate::constants::{MAX_ENTRIES_PER_WARE, MAX_TREE_SIZE, MAX_WARE_SIZE};
use crate::error::{Error, Result};
use crate::fsutil;
use crate::hashing::digest_str;
use crate::warehouse;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs;
use std::io::{Cursor, Read, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};
use tracing::info;

#[derive(Debug)]
pub struct TarTransmat {
    stage: PathBuf,
}

impl TarTransmat {
    pub fn new(stage_root: PathBuf) -> Result<TarTransmat> {
        Ok(TarTransmat {
            stage: super::init_stage(stage_root)?,
        })
    }
}

impl Transmat for TarTransmat {
    fn kind(&self) -> &'static str {
        "tar"
    }

    fn materialize(&self, kind: &str, hash: &str, warehouses: &[String]) -> Result<Arena> {
        self.check_kind(kind)?;
        let addr = warehouse::resolve_read(warehouses, hash)?;
        let blob = super::fetch_blob(&addr, hash)?;

        // Decompress fully before extraction so the hash verdict comes
        // from exactly the bytes we are about to unpack.
        let mut tar_bytes = Vec::new();
        GzDecoder::new(&blob[..])
            .take(MAX_WARE_SIZE as u64 + 1)
            .read_to_end(&mut tar_bytes)
            .map_err(|e| Error::WareCorrupt {
                hash: hash.to_string(),
                msg: format!("gzip: {e}"),
            })?;
        if tar_bytes.len() > MAX_WARE_SIZE {
            return Err(Error::WareCorrupt {
                hash: hash.to_string(),
                msg: "uncompressed ware exceeds size limit".to_string(),
            });
        }

        let actual = digest_str(&tar_bytes);
        if actual != hash {
            return Err(Error::HashMismatch {
                expected: hash.to_string(),
                actual,
            });
        }

        let stage = tempfile::tempdir_in(&self.stage).map_err(Error::unknown)?;
        let tree = stage.path().join("tree");
        fs::create_dir(&tree).map_err(Error::unknown)?;
        unpack_tree(&tar_bytes, &tree).map_err(|msg| Error::WareCorrupt {
            hash: hash.to_string(),
            msg,
        })?;

        info!(hash, uri = %addr.uri, "tar ware materialized");
        let kept = stage.into_path();
        Ok(Arena::with_scrap(kept.join("tree"), hash.to_string(), kept))
    }

    fn scan(&self, kind: &str, subject: &Path, warehouses: &[String]) -> Result<String> {
        self.check_kind(kind)?;
        let tar_bytes = pack_tree(subject)
            .map_err(|e| Error::unknown(format!("cannot pack {}: {e}", subject.display())))?;
        let hash = digest_str(&tar_bytes);

        if !warehouses.is_empty() {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&tar_bytes).map_err(Error::unknown)?;
            let gz = encoder.finish().map_err(Error::unknown)?;
            warehouse::commit_all(warehouses, |addr| super::commit_blob(addr, &hash, &gz))?;
        }
        Ok(hash)
    }
}

// =============================================================================
// Canonical tar codec (shared with the cas kind)
// =============================================================================

/// Serializes a tree to canonical tar bytes: depth-first, sorted
/// siblings, ustar headers carrying mode/uid/gid/mtime, paths rooted at
/// `./`.
pub(crate) fn pack_tree(root: &Path) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    pack_node(&mut builder, root, Path::new("."))?;
    builder.into_inner()
}

fn pack_node(
    builder: &mut tar::Builder<Vec<u8>>,
    full: &Path,
    rel: &Path,
) -> std::io::Result<()> {
    let meta = fs::symlink_metadata(full)?;
    let ftype = meta.file_type();

    let mut header = tar::Header::new_ustar();
    header.set_mode(meta.mode() & 0o7777);
    header.set_uid(meta.uid() as u64);
    header.set_gid(meta.gid() as u64);
    header.set_mtime(meta.mtime().max(0) as u64);

    if ftype.is_dir() {
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        builder.append_data(&mut header, rel, std::io::empty())?;
        for entry in fsutil::sorted_entries(full)? {
            pack_node(builder, &entry.path(), &rel.join(entry.file_name()))?;
        }
    } else if ftype.is_symlink() {
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        builder.append_link(&mut header, rel, fs::read_link(full)?)?;
    } else {
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(meta.len());
        builder.append_data(&mut header, rel, fs::File::open(full)?)?;
    }
    Ok(())
}

/// Extracts canonical tar bytes into `dest`, which must be an existing
/// empty directory. Returns a message describing the first defect in a
/// hostile or damaged archive.
pub(crate) fn unpack_tree(tar_bytes: &[u8], dest: &Path) -> std::result::Result<(), String> {
    let mut archive = tar::Archive::new(Cursor::new(tar_bytes));
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);

    let mut entry_count = 0usize;
    let mut total_size = 0u64;
    // Directory mtimes are restored after extraction; unpacking children
    // into a directory would perturb a freshly-set stamp.
    let mut dir_mtimes: Vec<(PathBuf, u64)> = Vec::new();

    for entry in archive.entries().map_err(|e| e.to_string())? {
        let mut entry = entry.map_err(|e| e.to_string())?;

        entry_count += 1;
        if entry_count > MAX_ENTRIES_PER_WARE {
            return Err(format!("archive exceeds {MAX_ENTRIES_PER_WARE} entries"));
        }
        total_size += entry.size();
        if total_size > MAX_TREE_SIZE {
            return Err("archive exceeds unpacked size limit".to_string());
        }

        let rel = entry.path().map_err(|e| e.to_string())?.into_owned();
        check_entry_path(&rel)?;

        let entry_type = entry.header().entry_type();
        if entry_type.is_symlink() || entry_type.is_hard_link() {
            if let Ok(Some(target)) = entry.link_name() {
                check_link_target(&rel, &target)?;
            }
        }

        if entry_type.is_dir() {
            dir_mtimes.push((dest.join(&rel), entry.header().mtime().unwrap_or(0)));
        }

        entry
            .unpack_in(dest)
            .map_err(|e| format!("entry {}: {e}", rel.display()))?;
    }

    // Deepest directories first, so parents are stamped last.
    dir_mtimes.sort_by(|a, b| b.0.components().count().cmp(&a.0.components().count()));
    for (path, mtime) in dir_mtimes {
        if path.exists() {
            fsutil::set_mtime_nofollow(&path, mtime as i64, 0).map_err(|e| e.to_string())?;
        }
    }
    Ok(())
}

fn check_entry_path(rel: &Path) -> std::result::Result<(), String> {
    for component in rel.components() {
        match component {
            Component::ParentDir => {
                return Err(format!("path traversal in entry {}", rel.display()));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(format!("absolute path in entry {}", rel.display()));
            }
            _ => {}
        }
    }
    Ok(())
}

fn check_link_target(rel: &Path, target: &Path) -> std::result::Result<(), String> {
    // Resolve relative to the entry's parent and refuse anything that
    // steps above the tree root.
    let base = rel.parent().unwrap_or(Path::new(""));
    let resolved = base.join(target);
    let mut depth: i32 = 0;
    for component in resolved.components() {
        match component {
            Component::RootDir | Component::Prefix(_) => {
                return Err(format!("absolute link target in entry {}", rel.display()));
            }
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return Err(format!("link target escapes tree in entry {}", rel.display()));
                }
            }
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
        }
    }
    Ok(())
}
