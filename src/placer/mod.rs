//! Placers: the single-placement primitive.
//!
//! A placer makes one source tree appear at one target path. Three
//! implementations cover the capability space:
//!
//! | Placer  | Needs kernel | Readonly        | Source isolation |
//! |---------|--------------|-----------------|------------------|
//! | Copy    | no           | advisory (chmod)| yes              |
//! | Bind    | mount(2)     | enforced (EROFS)| no               |
//! | Overlay | union fs     | enforced        | yes              |
//!
//! [`PlacerSet`] picks, per placement, the cheapest placer satisfying
//! the required capabilities, falling back to Copy with a warning when
//! kernel support is missing. Teardown is always invoked in reverse
//! order of placement and must succeed on the first attempt even if the
//! target tree was mutated.

mod bind;
mod copy;
mod overlay;

pub use bind::BindPlacer;
pub use copy::CopyPlacer;
pub use overlay::OverlayPlacer;

use crate::error::Result;
use crate::fsutil;
use crate::platform::{Capability, Platform};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// One placement primitive.
pub trait Placer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Makes `source` appear at `target`. The target's parent chain
    /// already exists; the target itself may exist and is replaced or
    /// covered, per implementation.
    fn place(&self, source: &Path, target: &Path, writable: bool) -> Result<Placement>;
}

/// A live placement and how to undo it.
#[derive(Debug)]
pub struct Placement {
    target: PathBuf,
    cleanup: Cleanup,
    done: bool,
}

#[derive(Debug)]
enum Cleanup {
    /// Remove the tree at the target (copy placements).
    RemoveTree,
    /// Unmount the target (bind placements).
    Unmount,
    /// Unmount the target, then remove per-placement scratch (overlay).
    UnmountAndScrap(PathBuf),
}

impl Placement {
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Releases the placement. Failures are logged, never propagated:
    /// teardown runs on every exit path and has nowhere to report to.
    pub fn teardown(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        match &self.cleanup {
            Cleanup::RemoveTree => {
                if let Err(e) = fsutil::remove_tree(&self.target) {
                    warn!(target = %self.target.display(), error = %e, "placement removal failed");
                }
            }
            Cleanup::Unmount => unmount(&self.target),
            Cleanup::UnmountAndScrap(scrap) => {
                unmount(&self.target);
                if let Err(e) = fsutil::remove_tree(scrap) {
                    warn!(scrap = %scrap.display(), error = %e, "overlay scratch removal failed");
                }
            }
        }
    }
}

impl Drop for Placement {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn unmount(target: &Path) {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::ffi::OsStrExt;
        let Ok(c) = std::ffi::CString::new(target.as_os_str().as_bytes()) else {
            return;
        };
        // SAFETY: c is a valid NUL-terminated path.
        let rc = unsafe { libc::umount2(c.as_ptr(), 0) };
        if rc != 0 {
            // A busy mount still has to come off; detach lets the kernel
            // finish when the last user exits.
            let rc2 = unsafe { libc::umount2(c.as_ptr(), libc::MNT_DETACH) };
            if rc2 != 0 {
                warn!(
                    target = %target.display(),
                    error = %std::io::Error::last_os_error(),
                    "unmount failed"
                );
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        warn!(target = %target.display(), "unmount requested on non-linux host");
    }
}

// =============================================================================
// Selection
// =============================================================================

/// The placers available on this host, with per-placement selection.
pub struct PlacerSet {
    copy: Arc<CopyPlacer>,
    bind: Option<Arc<BindPlacer>>,
    overlay: Option<Arc<OverlayPlacer>>,
}

impl PlacerSet {
    /// Builds the set from probed capabilities. Overlay scratch space
    /// lives under `scrap_root`.
    pub fn detect(platform: &Platform, scrap_root: &Path) -> Result<PlacerSet> {
        let bind = platform
            .has(Capability::Mounts)
            .then(|| Arc::new(BindPlacer::new()));
        let overlay = if platform.has(Capability::Overlay) {
            Some(Arc::new(OverlayPlacer::new(scrap_root.join("overlay"))?))
        } else {
            None
        };
        Ok(PlacerSet {
            copy: Arc::new(CopyPlacer::new()),
            bind,
            overlay,
        })
    }

    /// Everything falls back to copying. Useful for tests and
    /// unprivileged hosts.
    pub fn copy_only() -> PlacerSet {
        PlacerSet {
            copy: Arc::new(CopyPlacer::new()),
            bind: None,
            overlay: None,
        }
    }

    /// Selects a placer for an arena placement.
    ///
    /// Writable placements need source isolation (the arena must stay
    /// pristine for teardown accounting); readonly placements want
    /// kernel-enforced readonly. Either way Copy satisfies the
    /// requirement when the kernel cannot, at the cost of either
    /// enforcement strength (readonly becomes advisory) or disk.
    pub fn for_arena(&self, writable: bool) -> Arc<dyn Placer> {
        if writable {
            match &self.overlay {
                Some(overlay) => overlay.clone() as Arc<dyn Placer>,
                None => self.copy.clone() as Arc<dyn Placer>,
            }
        } else {
            match &self.bind {
                Some(bind) => bind.clone() as Arc<dyn Placer>,
                None => {
                    warn!("no mount support; readonly placement is advisory only");
                    self.copy.clone() as Arc<dyn Placer>
                }
            }
        }
    }

    /// Selects a placer for a host-mount escape. Escapes must expose
    /// the live host tree, so only bind qualifies.
    pub fn for_escape(&self) -> Result<Arc<dyn Placer>> {
        self.bind
            .clone()
            .map(|b| b as Arc<dyn Placer>)
            .ok_or_else(|| crate::error::Error::Assembly {
                msg: "host mounts require mount privileges".to_string(),
            })
    }
}
