//! The filter engine: uid/gid/mtime normalization across a tree.
//!
//! Filters are applied to inputs after materialization and to outputs
//! before scanning; that timing is the only input/output distinction.
//! Unspecified fields always resolve to the same forced defaults
//! (uid 1000, gid 1000, mtime 2010-01-01T00:00:00Z) — keeping an
//! attribute as stored takes an explicit `keep`. The traversal is
//! depth-first post-order with sorted siblings, so directory mtimes are
//! not perturbed by subsequent child modifications, and two applications
//! to bit-identical trees yield bit-identical results.

use crate::constants::{FILTER_DEFAULT_GID, FILTER_DEFAULT_MTIME_SECS, FILTER_DEFAULT_UID};
use crate::error::{Error, Result};
use crate::formula::{FilterSet, IdFilter, MtimeFilter};
use crate::fsutil;
use chrono::Utc;
use std::path::Path;

/// Effective ids of the process that invoked the executor, captured
/// before any privilege drop. Used by the `host` filter mode.
#[derive(Debug, Clone, Copy)]
pub struct HostIdentity {
    pub uid: u32,
    pub gid: u32,
}

impl HostIdentity {
    /// Captures the current effective ids.
    pub fn capture() -> HostIdentity {
        HostIdentity {
            uid: fsutil::effective_uid(),
            gid: fsutil::effective_gid(),
        }
    }
}

/// Fully-resolved per-tree actions. None means leave as-is, and is only
/// produced by an explicit `keep` directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedFilters {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Seconds and nanoseconds since the epoch.
    pub mtime: Option<(i64, u32)>,
}

impl ResolvedFilters {
    /// Resolves a filter set against the captured host identity.
    /// Unspecified fields take the forced defaults; `host` mtime
    /// resolves to the moment of resolution.
    pub fn resolve(filters: &FilterSet, host: HostIdentity) -> ResolvedFilters {
        let uid = match filters.uid {
            None => Some(FILTER_DEFAULT_UID),
            Some(IdFilter::Keep) => None,
            Some(IdFilter::Host) => Some(host.uid),
            Some(IdFilter::Use(v)) => Some(v),
        };
        let gid = match filters.gid {
            None => Some(FILTER_DEFAULT_GID),
            Some(IdFilter::Keep) => None,
            Some(IdFilter::Host) => Some(host.gid),
            Some(IdFilter::Use(v)) => Some(v),
        };
        let mtime = match filters.mtime {
            None => Some((FILTER_DEFAULT_MTIME_SECS, 0)),
            Some(MtimeFilter::Keep) => None,
            Some(MtimeFilter::Host) => {
                let now = Utc::now();
                Some((now.timestamp(), now.timestamp_subsec_nanos()))
            }
            Some(MtimeFilter::Use(t)) => Some((t.timestamp(), t.timestamp_subsec_nanos())),
        };
        ResolvedFilters { uid, gid, mtime }
    }

    fn is_noop(&self) -> bool {
        self.uid.is_none() && self.gid.is_none() && self.mtime.is_none()
    }
}

/// Applies resolved filters to every file, directory, and symlink under
/// `root`, including `root` itself.
pub fn apply(root: &Path, resolved: ResolvedFilters) -> Result<()> {
    if resolved.is_noop() {
        return Ok(());
    }
    apply_node(root, resolved).map_err(|e| Error::unknown(format!("filtering {}: {e}", root.display())))
}

fn apply_node(path: &Path, resolved: ResolvedFilters) -> std::io::Result<()> {
    let meta = std::fs::symlink_metadata(path)?;
    if meta.is_dir() {
        for entry in fsutil::sorted_entries(path)? {
            apply_node(&entry.path(), resolved)?;
        }
    }
    if resolved.uid.is_some() || resolved.gid.is_some() {
        use std::os::unix::fs::MetadataExt;
        let uid = resolved.uid.unwrap_or_else(|| meta.uid());
        let gid = resolved.gid.unwrap_or_else(|| meta.gid());
        fsutil::lchown(path, uid, gid)?;
    }
    if let Some((secs, nanos)) = resolved.mtime {
        fsutil::set_mtime_nofollow(path, secs, nanos)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::MetadataExt;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, std::path::PathBuf) {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("tree");
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("sub/file"), b"contents").unwrap();
        (tmp, root)
    }

    #[test]
    fn unspecified_fields_take_forced_defaults() {
        let resolved = ResolvedFilters::resolve(
            &FilterSet::default(),
            HostIdentity { uid: 1, gid: 1 },
        );
        assert_eq!(resolved.uid, Some(FILTER_DEFAULT_UID));
        assert_eq!(resolved.gid, Some(FILTER_DEFAULT_GID));
        assert_eq!(resolved.mtime, Some((FILTER_DEFAULT_MTIME_SECS, 0)));
    }

    #[test]
    fn default_mtime_flattens_whole_tree() {
        let (_tmp, root) = fixture();
        let resolved = ResolvedFilters {
            uid: None,
            gid: None,
            mtime: Some((FILTER_DEFAULT_MTIME_SECS, 0)),
        };
        apply(&root, resolved).unwrap();
        for p in [root.clone(), root.join("sub"), root.join("sub/file")] {
            assert_eq!(fs::symlink_metadata(&p).unwrap().mtime(), FILTER_DEFAULT_MTIME_SECS);
        }
    }

    #[test]
    fn explicit_keep_is_a_noop() {
        let (_tmp, root) = fixture();
        let before = fs::symlink_metadata(root.join("sub/file")).unwrap().mtime();
        let filters = FilterSet {
            uid: Some(IdFilter::Keep),
            gid: Some(IdFilter::Keep),
            mtime: Some(MtimeFilter::Keep),
        };
        let resolved = ResolvedFilters::resolve(&filters, HostIdentity { uid: 1, gid: 1 });
        assert!(resolved.is_noop());
        apply(&root, resolved).unwrap();
        assert_eq!(fs::symlink_metadata(root.join("sub/file")).unwrap().mtime(), before);
    }

    #[test]
    fn idempotent() {
        let (_tmp, root) = fixture();
        let resolved = ResolvedFilters {
            uid: None,
            gid: None,
            mtime: Some((1_262_304_000, 0)),
        };
        apply(&root, resolved).unwrap();
        let first = fs::symlink_metadata(root.join("sub")).unwrap().mtime();
        apply(&root, resolved).unwrap();
        assert_eq!(fs::symlink_metadata(root.join("sub")).unwrap().mtime(), first);
    }

    #[test]
    fn host_mode_uses_captured_identity() {
        let filters = FilterSet {
            uid: Some(IdFilter::Host),
            gid: Some(IdFilter::Host),
            mtime: Some(MtimeFilter::Keep),
        };
        let host = HostIdentity { uid: 4242, gid: 4343 };
        let resolved = ResolvedFilters::resolve(&filters, host);
        assert_eq!(resolved.uid, Some(4242));
        assert_eq!(resolved.gid, Some(4343));
        assert_eq!(resolved.mtime, None);
    }
}
