//! The bind placer. Kernel bind-mount of source onto target; cheap and
//! instant, but writes at the target land in the source (no isolation).
//! Readonly placements are enforced with a readonly remount, so writes
//! inside the rootfs fail with `EROFS`.

use super::{Cleanup, Placement, Placer};
use crate::error::{Error, Result};
use std::fs;
use std::path::Path;
use tracing::debug;

pub struct BindPlacer;

impl BindPlacer {
    pub fn new() -> BindPlacer {
        BindPlacer
    }
}

impl Default for BindPlacer {
    fn default() -> Self {
        Self::new()
    }
}

impl Placer for BindPlacer {
    fn name(&self) -> &'static str {
        "bind"
    }

    fn place(&self, source: &Path, target: &Path, writable: bool) -> Result<Placement> {
        prepare_mountpoint(target)?;
        mount::bind(source, target)?;
        if !writable {
            if let Err(e) = mount::remount_readonly(target) {
                // A writable mount must not masquerade as readonly.
                super::unmount(target);
                return Err(e);
            }
        }
        debug!(source = %source.display(), target = %target.display(), writable, "bind placement");
        Ok(Placement {
            target: target.to_path_buf(),
            cleanup: Cleanup::Unmount,
            done: false,
        })
    }
}

/// Mountpoints must be directories; a file occupying the target is
/// consumed, like any other content a placement covers.
pub(super) fn prepare_mountpoint(target: &Path) -> Result<()> {
    if target.is_dir() {
        return Ok(());
    }
    crate::fsutil::remove_tree(target).map_err(|e| Error::Assembly {
        msg: format!("cannot clear mountpoint {}: {e}", target.display()),
    })?;
    fs::create_dir(target).map_err(|e| Error::Assembly {
        msg: format!("cannot create mountpoint {}: {e}", target.display()),
    })
}

#[cfg(target_os = "linux")]
mod mount {
    use crate::error::{Error, Result};
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;
    use std::ptr;

    fn cstring(path: &Path) -> Result<CString> {
        CString::new(path.as_os_str().as_bytes()).map_err(|_| Error::Assembly {
            msg: "path contains NUL".to_string(),
        })
    }

    pub fn bind(source: &Path, target: &Path) -> Result<()> {
        let src = cstring(source)?;
        let tgt = cstring(target)?;
        // SAFETY: both strings are valid NUL-terminated paths.
        let rc = unsafe {
            libc::mount(
                src.as_ptr(),
                tgt.as_ptr(),
                ptr::null(),
                libc::MS_BIND | libc::MS_REC,
                ptr::null(),
            )
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(Error::Assembly {
                msg: format!(
                    "bind mount {} -> {} failed: {}",
                    source.display(),
                    target.display(),
                    std::io::Error::last_os_error()
                ),
            })
        }
    }

    pub fn remount_readonly(target: &Path) -> Result<()> {
        let tgt = cstring(target)?;
        // SAFETY: tgt is a valid NUL-terminated path.
        let rc = unsafe {
            libc::mount(
                ptr::null(),
                tgt.as_ptr(),
                ptr::null(),
                libc::MS_BIND | libc::MS_REMOUNT | libc::MS_RDONLY,
                ptr::null(),
            )
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(Error::Assembly {
                msg: format!(
                    "readonly remount of {} failed: {}",
                    target.display(),
                    std::io::Error::last_os_error()
                ),
            })
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod mount {
    use crate::error::{Error, Result};
    use std::path::Path;

    pub fn bind(_source: &Path, _target: &Path) -> Result<()> {
        Err(Error::Assembly {
            msg: "bind mounts require linux".to_string(),
        })
    }

    pub fn remount_readonly(_target: &Path) -> Result<()> {
        Err(Error::Assembly {
            msg: "bind mounts require linux".to_string(),
        })
    }
}
