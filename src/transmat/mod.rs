//! The transmat layer: pluggable, content-addressable data transports.
//!
//! A transmat *materializes* a filesystem from a hash plus warehouse
//! coordinates, and *scans* a filesystem back to a hash while committing
//! the data to warehouses. Transmats are registered by kind string; the
//! executor performs one registry lookup per input and dispatches
//! through the trait.
//!
//! Every implementation is robust to partial failure: a materialization
//! either produces a fully valid arena or returns an error and leaves no
//! state behind. Content hashes are verified on completion for all
//! kinds, so even an untrusted warehouse is safe to read from.

mod cas;
mod dir;
mod git;
mod tar;

pub use self::cas::CasTransmat;
pub use self::dir::DirTransmat;
pub use self::git::GitTransmat;
pub use self::tar::TarTransmat;

use crate::error::{Error, Result};
use crate::fsutil;
use crate::warehouse::{Flavor, WarehouseAddr};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

// =============================================================================
// Arena
// =============================================================================

/// A transient on-disk materialization of one input.
///
/// Owned by the executor until the run's arena group is torn down.
/// Teardown is idempotent and tolerates already-removed paths; drop is a
/// logging backstop only, explicit teardown is the supported release
/// path.
#[derive(Debug)]
pub struct Arena {
    path: PathBuf,
    hash: String,
    /// Root actually removed on teardown; holds `path` plus any staging
    /// siblings (e.g. a bare git dir beside the work tree).
    scrap: PathBuf,
    torn_down: bool,
}

impl Arena {
    pub fn new(path: PathBuf, hash: String) -> Arena {
        let scrap = path.clone();
        Arena {
            path,
            hash,
            scrap,
            torn_down: false,
        }
    }

    /// An arena whose tree lives inside a wider staging root.
    pub fn with_scrap(path: PathBuf, hash: String, scrap: PathBuf) -> Arena {
        Arena {
            path,
            hash,
            scrap,
            torn_down: false,
        }
    }

    /// The ready directory tree.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// What this arena claims to hold.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Releases the arena's disk space. Never propagates errors;
    /// failures are logged and the arena is considered gone.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        if let Err(e) = fsutil::remove_tree(&self.scrap) {
            warn!(path = %self.scrap.display(), error = %e, "arena teardown failed");
        }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        self.teardown();
    }
}

// =============================================================================
// Transmat Trait & Registry
// =============================================================================

/// A data transport for one kind of ware.
pub trait Transmat: Send + Sync + std::fmt::Debug {
    /// The kind string this transmat serves.
    fn kind(&self) -> &'static str;

    /// Fetches the ware named `hash` from the first available warehouse
    /// and stages it as a ready directory tree, verifying the content
    /// hash on completion.
    fn materialize(&self, kind: &str, hash: &str, warehouses: &[String]) -> Result<Arena>;

    /// Traverses `subject` in canonical order, produces its content id,
    /// and commits the data to every configured warehouse. Not every
    /// kind supports scanning.
    fn scan(&self, kind: &str, subject: &Path, warehouses: &[String]) -> Result<String>;

    /// Guards against a registry wiring mistake handing a request to the
    /// wrong implementation.
    fn check_kind(&self, kind: &str) -> Result<()> {
        if kind == self.kind() {
            Ok(())
        } else {
            Err(Error::ConfigValidation {
                msg: format!("transmat for {:?} asked to handle {kind:?}", self.kind()),
            })
        }
    }
}

/// Registry of transmats keyed by kind.
pub struct TransmatRegistry {
    by_kind: BTreeMap<&'static str, Arc<dyn Transmat>>,
}

impl TransmatRegistry {
    pub fn empty() -> TransmatRegistry {
        TransmatRegistry {
            by_kind: BTreeMap::new(),
        }
    }

    /// A registry with every kind this engine ships, staging arenas
    /// under `stage_root`.
    pub fn standard(stage_root: &Path) -> Result<TransmatRegistry> {
        let mut registry = TransmatRegistry::empty();
        registry.register(Arc::new(DirTransmat::new(stage_root.join("dir"))?));
        registry.register(Arc::new(TarTransmat::new(stage_root.join("tar"))?));
        registry.register(Arc::new(CasTransmat::new(stage_root.join("cas"))?));
        registry.register(Arc::new(GitTransmat::new(stage_root.join("git"))?));
        Ok(registry)
    }

    pub fn register(&mut self, transmat: Arc<dyn Transmat>) {
        self.by_kind.insert(transmat.kind(), transmat);
    }

    pub fn lookup(&self, kind: &str) -> Result<Arc<dyn Transmat>> {
        self.by_kind
            .get(kind)
            .cloned()
            .ok_or_else(|| Error::ConfigValidation {
                msg: format!("no transmat registered for kind {kind:?}"),
            })
    }

    pub fn materialize(&self, kind: &str, hash: &str, warehouses: &[String]) -> Result<Arena> {
        self.lookup(kind)?.materialize(kind, hash, warehouses)
    }

    pub fn scan(&self, kind: &str, subject: &Path, warehouses: &[String]) -> Result<String> {
        self.lookup(kind)?.scan(kind, subject, warehouses)
    }
}

// =============================================================================
// Blob plumbing shared by the ware kinds
// =============================================================================

/// Creates a staging workspace for a transmat, returning its absolute
/// path.
pub(crate) fn init_stage(stage_root: PathBuf) -> Result<PathBuf> {
    fs::create_dir_all(&stage_root)
        .map_err(|e| Error::unknown(format!("cannot set up staging at {}: {e}", stage_root.display())))?;
    stage_root
        .canonicalize()
        .map_err(|e| Error::unknown(format!("cannot set up staging at {}: {e}", stage_root.display())))
}

/// Reads the blob named `hash` from an already-pinged warehouse.
///
/// Missing blob is `ErrWareDNE`; an unreadable blob is
/// `ErrWareCorrupt`; an oversized blob is refused the same way.
pub(crate) fn fetch_blob(addr: &WarehouseAddr, hash: &str) -> Result<Vec<u8>> {
    let location = addr.ware_location(hash).ok_or_else(|| Error::WareDne {
        hash: hash.to_string(),
    })?;
    if !location.is_file() {
        return Err(Error::WareDne {
            hash: hash.to_string(),
        });
    }
    let meta = fs::metadata(&location).map_err(|e| Error::WareCorrupt {
        hash: hash.to_string(),
        msg: e.to_string(),
    })?;
    if meta.len() > crate::constants::MAX_WARE_SIZE as u64 {
        return Err(Error::WareCorrupt {
            hash: hash.to_string(),
            msg: format!("blob exceeds size limit: {} bytes", meta.len()),
        });
    }
    fs::read(&location).map_err(|e| Error::WareCorrupt {
        hash: hash.to_string(),
        msg: e.to_string(),
    })
}

/// Commits blob bytes for the ware named `hash` into one warehouse.
///
/// Pool slots that already exist are left alone (content addressing
/// makes the write redundant). Writes are atomic: a uniquely-named temp
/// file in the destination directory, then a rename.
pub(crate) fn commit_blob(addr: &WarehouseAddr, hash: &str, bytes: &[u8]) -> Result<()> {
    let location = addr
        .ware_location(hash)
        .ok_or_else(|| Error::unknown(format!("hash {hash:?} cannot address a pool slot")))?;
    if addr.flavor == Flavor::ContentAddressed && location.exists() {
        debug!(hash, uri = %addr.uri, "blob already present, skipping commit");
        return Ok(());
    }
    if let Some(parent) = location.parent() {
        fs::create_dir_all(parent).map_err(|e| commit_err(addr, e))?;
    }
    let tmp = location.with_extension(format!("tmp.{}", uuid::Uuid::now_v7()));
    fs::write(&tmp, bytes).map_err(|e| commit_err(addr, e))?;
    fs::rename(&tmp, &location).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        commit_err(addr, e)
    })?;
    Ok(())
}

fn commit_err(addr: &WarehouseAddr, e: io::Error) -> Error {
    Error::WarehouseProblem {
        msg: e.to_string(),
        uris: vec![addr.uri.clone()],
    }
}
