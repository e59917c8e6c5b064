//! Warehouse addressing and the ordered-failover resolver.
//!
//! A warehouse is a storage endpoint addressed by URI. The engine ships
//! two filesystem-backed flavors:
//!
//! - `file://<path>` — the URI addresses one ware directly.
//! - `ca+file://<path>` — the URI addresses a content-addressed pool;
//!   wares live in sharded slots keyed by their hash, in a two-level
//!   directory layout (`<root>/sha256/<hh>/<hex>`) so large pools do not
//!   degrade directory performance.
//!
//! Reads probe the configured URIs in order and take the first that
//! answers a ping; unavailable warehouses are logged and skipped, and
//! only full exhaustion is an error. Commits must be accepted by every
//! configured warehouse.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Flavor of a filesystem warehouse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    /// The URI addresses one ware directly.
    Direct,
    /// The URI addresses a pool of wares keyed by hash.
    ContentAddressed,
}

/// A parsed warehouse coordinate.
#[derive(Debug, Clone)]
pub struct WarehouseAddr {
    /// The URI as configured, for reporting.
    pub uri: String,
    pub flavor: Flavor,
    /// Filesystem location (absolute or caller-relative).
    pub root: PathBuf,
}

impl WarehouseAddr {
    /// Parses a warehouse URI. Unknown schemes return None; the resolver
    /// skips them the same way it skips unreachable endpoints.
    pub fn parse(uri: &str) -> Option<WarehouseAddr> {
        let (flavor, rest) = if let Some(rest) = uri.strip_prefix("ca+file://") {
            (Flavor::ContentAddressed, rest)
        } else if let Some(rest) = uri.strip_prefix("file://") {
            (Flavor::Direct, rest)
        } else {
            return None;
        };
        if rest.is_empty() {
            return None;
        }
        Some(WarehouseAddr {
            uri: uri.to_string(),
            flavor,
            root: PathBuf::from(rest),
        })
    }

    /// Answers whether this warehouse responds for reading.
    ///
    /// For direct addresses the ware itself must be present (there is
    /// nothing else to probe); for pools the pool root must exist.
    pub fn ping_read(&self) -> bool {
        self.root.exists()
    }

    /// Answers whether this warehouse can accept a commit: the location
    /// (or its parent) must exist as a directory we can create under.
    pub fn ping_write(&self) -> bool {
        match self.flavor {
            Flavor::ContentAddressed => self.root.is_dir(),
            Flavor::Direct => self
                .root
                .parent()
                .map(|p| p.as_os_str().is_empty() || p.is_dir())
                .unwrap_or(false),
        }
    }

    /// The filesystem location of the ware named `hash` in this
    /// warehouse. None when the hash cannot name a pool slot.
    pub fn ware_location(&self, hash: &str) -> Option<PathBuf> {
        match self.flavor {
            Flavor::Direct => Some(self.root.clone()),
            Flavor::ContentAddressed => pool_slot(&self.root, hash),
        }
    }
}

/// Computes the sharded slot path for a hash inside a pool root.
///
/// Validates the digest before constructing paths: the algorithm label
/// must be alphanumeric and the digest hex, so a hostile hash string can
/// never traverse outside the pool.
pub fn pool_slot(root: &Path, hash: &str) -> Option<PathBuf> {
    let (algo, digest) = hash.split_once(':')?;
    if algo.is_empty() || !algo.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    if digest.len() < 3 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(root.join(algo).join(&digest[..2]).join(digest))
}

// =============================================================================
// Resolver
// =============================================================================

/// Probes `uris` in order and returns the first warehouse that answers a
/// read ping. Skips (with a log line) anything unparseable or
/// unreachable; fails only when the whole list is exhausted.
pub fn resolve_read(uris: &[String], hash: &str) -> Result<WarehouseAddr> {
    if uris.is_empty() {
        return Err(Error::WarehouseUnavailable {
            hash: hash.to_string(),
        });
    }
    for uri in uris {
        let Some(addr) = WarehouseAddr::parse(uri) else {
            warn!(uri = %uri, "unrecognized warehouse uri, skipping");
            continue;
        };
        if addr.ping_read() {
            info!(uri = %uri, "warehouse selected");
            return Ok(addr);
        }
        info!(uri = %uri, "warehouse unavailable, skipping");
    }
    Err(Error::WarehouseUnavailable {
        hash: hash.to_string(),
    })
}

/// Runs `commit` against every configured warehouse. All must accept;
/// any failures are gathered into one `ErrWarehouseProblem` naming the
/// failing URIs.
pub fn commit_all(
    uris: &[String],
    mut commit: impl FnMut(&WarehouseAddr) -> Result<()>,
) -> Result<()> {
    let mut failing = Vec::new();
    let mut first_msg = String::new();
    for uri in uris {
        let Some(addr) = WarehouseAddr::parse(uri) else {
            failing.push(uri.clone());
            if first_msg.is_empty() {
                first_msg = format!("unrecognized warehouse uri {uri:?}");
            }
            continue;
        };
        match commit(&addr) {
            Ok(()) => debug!(uri = %uri, "commit accepted"),
            Err(e) => {
                warn!(uri = %uri, error = %e, "commit failed");
                if first_msg.is_empty() {
                    first_msg = e.to_string();
                }
                failing.push(uri.clone());
            }
        }
    }
    if failing.is_empty() {
        Ok(())
    } else {
        Err(Error::WarehouseProblem {
            msg: first_msg,
            uris: failing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn parse_flavors() {
        let direct = WarehouseAddr::parse("file:///tmp/ware").unwrap();
        assert_eq!(direct.flavor, Flavor::Direct);
        assert_eq!(direct.root, PathBuf::from("/tmp/ware"));

        let pool = WarehouseAddr::parse("ca+file://./pool").unwrap();
        assert_eq!(pool.flavor, Flavor::ContentAddressed);

        assert!(WarehouseAddr::parse("s3://bucket/key").is_none());
        assert!(WarehouseAddr::parse("file://").is_none());
    }

    #[test]
    fn pool_slot_shards_and_sanitizes() {
        let root = Path::new("/pool");
        let slot = pool_slot(root, "sha256:abcdef").unwrap();
        assert_eq!(slot, PathBuf::from("/pool/sha256/ab/abcdef"));

        assert!(pool_slot(root, "nocolon").is_none());
        assert!(pool_slot(root, "sha256:../../etc").is_none());
        assert!(pool_slot(root, "../x:abcdef").is_none());
    }

    #[test]
    fn failover_takes_first_reachable() {
        let dir = TempDir::new().unwrap();
        let good = format!("file://{}", dir.path().display());
        let uris = vec!["file:///definitely/not/here".to_string(), good.clone()];
        let addr = resolve_read(&uris, "sha256:aa").unwrap();
        assert_eq!(addr.uri, good);
    }

    #[test]
    fn exhaustion_is_unavailable() {
        let uris = vec!["file:///nope/1".to_string(), "gopher://old".to_string()];
        let err = resolve_read(&uris, "sha256:aa").unwrap_err();
        assert_eq!(err.kind(), "ErrWarehouseUnavailable");
    }

    #[test]
    fn commit_all_gathers_failures() {
        let dir = TempDir::new().unwrap();
        let good = format!("ca+file://{}", dir.path().display());
        let bad = "ca+file:///absent/pool".to_string();
        let err = commit_all(&[good, bad.clone()], |addr| {
            if addr.ping_write() {
                Ok(())
            } else {
                Err(Error::unknown("pool missing"))
            }
        })
        .unwrap_err();
        match err {
            Error::WarehouseProblem { uris, .. } => assert_eq!(uris, vec![bad]),
            other => panic!("wrong kind: {other:?}"),
        }
    }
}
