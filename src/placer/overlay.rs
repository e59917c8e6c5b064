//! The overlay placer. Mounts a union filesystem with the source as the
//! lower layer and a private upper layer, so the target is writable
//! while the source stays pristine. Each placement gets its own
//! upper/work scratch, removed at teardown.

use super::{Cleanup, Placement, Placer};
use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct OverlayPlacer {
    scrap_root: PathBuf,
}

impl OverlayPlacer {
    pub fn new(scrap_root: PathBuf) -> Result<OverlayPlacer> {
        fs::create_dir_all(&scrap_root).map_err(|e| Error::Assembly {
            msg: format!("cannot create overlay scratch {}: {e}", scrap_root.display()),
        })?;
        Ok(OverlayPlacer { scrap_root })
    }
}

impl Placer for OverlayPlacer {
    fn name(&self) -> &'static str {
        "overlay"
    }

    fn place(&self, source: &Path, target: &Path, writable: bool) -> Result<Placement> {
        super::bind::prepare_mountpoint(target)?;
        let scrap = self.scrap_root.join(uuid::Uuid::now_v7().to_string());
        let upper = scrap.join("upper");
        let work = scrap.join("work");
        fs::create_dir_all(&upper)
            .and_then(|_| fs::create_dir_all(&work))
            .map_err(|e| Error::Assembly {
                msg: format!("cannot create overlay scratch {}: {e}", scrap.display()),
            })?;

        if let Err(e) = mount_overlay(source, &upper, &work, target, writable) {
            let _ = fs::remove_dir_all(&scrap);
            return Err(e);
        }
        debug!(source = %source.display(), target = %target.display(), writable, "overlay placement");
        Ok(Placement {
            target: target.to_path_buf(),
            cleanup: Cleanup::UnmountAndScrap(scrap),
            done: false,
        })
    }
}

#[cfg(target_os = "linux")]
fn mount_overlay(
    lower: &Path,
    upper: &Path,
    work: &Path,
    target: &Path,
    writable: bool,
) -> Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    // Overlay option syntax cannot escape commas or colons; refuse paths
    // that would corrupt the option string.
    for path in [lower, upper, work] {
        let bytes = path.as_os_str().as_bytes();
        if bytes.contains(&b',') || bytes.contains(&b':') {
            return Err(Error::Assembly {
                msg: format!("path {} unusable as an overlay layer", path.display()),
            });
        }
    }

    let options = format!(
        "lowerdir={},upperdir={},workdir={}",
        lower.display(),
        upper.display(),
        work.display()
    );
    let fstype = CString::new("overlay").expect("static string");
    let opts = CString::new(options).map_err(|_| Error::Assembly {
        msg: "overlay options contain NUL".to_string(),
    })?;
    let tgt = CString::new(target.as_os_str().as_bytes()).map_err(|_| Error::Assembly {
        msg: "path contains NUL".to_string(),
    })?;

    let mut flags: libc::c_ulong = 0;
    if !writable {
        flags |= libc::MS_RDONLY;
    }
    // SAFETY: all pointers are valid NUL-terminated strings.
    let rc = unsafe {
        libc::mount(
            fstype.as_ptr(),
            tgt.as_ptr(),
            fstype.as_ptr(),
            flags,
            opts.as_ptr() as *const libc::c_void,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(Error::Assembly {
            msg: format!(
                "overlay mount onto {} failed: {}",
                target.display(),
                std::io::Error::last_os_error()
            ),
        })
    }
}

#[cfg(not(target_os = "linux"))]
fn mount_overlay(
    _lower: &Path,
    _upper: &Path,
    _work: &Path,
    _target: &Path,
    _writable: bool,
) -> Result<()> {
    Err(Error::Assembly {
        msg: "overlay mounts require linux".to_string(),
    })
}
