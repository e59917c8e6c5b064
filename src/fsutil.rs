//! Filesystem helpers shared by transmats, placers, and the filter
//! engine: deterministic ordered walks, metadata-preserving tree copy,
//! and the ownership/mtime syscalls std does not wrap.

use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;
use tracing::warn;

/// Directory entries sorted by name byte value. The foundation of every
/// deterministic traversal in the engine.
pub fn sorted_entries(dir: &Path) -> io::Result<Vec<fs::DirEntry>> {
    let mut entries: Vec<fs::DirEntry> = fs::read_dir(dir)?.collect::<io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());
    Ok(entries)
}

/// The current process's effective uid.
pub fn effective_uid() -> u32 {
    // SAFETY: geteuid has no failure modes.
    unsafe { libc::geteuid() }
}

/// The current process's effective gid.
pub fn effective_gid() -> u32 {
    // SAFETY: getegid has no failure modes.
    unsafe { libc::getegid() }
}

fn cstring(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))
}

/// Sets ownership on `path` itself, without following symlinks.
pub fn lchown(path: &Path, uid: u32, gid: u32) -> io::Result<()> {
    let c = cstring(path)?;
    // SAFETY: c is a valid NUL-terminated path.
    let rc = unsafe { libc::lchown(c.as_ptr(), uid, gid) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Sets the modification time on `path` itself with nanosecond
/// granularity, without following symlinks. atime is set to the same
/// instant; it is not tracked content.
pub fn set_mtime_nofollow(path: &Path, secs: i64, nanos: u32) -> io::Result<()> {
    let c = cstring(path)?;
    let ts = libc::timespec {
        tv_sec: secs as libc::time_t,
        tv_nsec: nanos as libc::c_long,
    };
    let times = [ts, ts];
    // SAFETY: c is a valid NUL-terminated path and times has two entries.
    let rc = unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            c.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Copies a tree, preserving mode, mtime, and symlinks. Ownership is
/// preserved when running privileged; otherwise files land owned by the
/// invoking user (a later filter pass is the supported way to pin ids).
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    let preserve_owner = effective_uid() == 0;
    copy_node(src, dst, preserve_owner)
}

fn copy_node(src: &Path, dst: &Path, preserve_owner: bool) -> io::Result<()> {
    let meta = fs::symlink_metadata(src)?;
    let ftype = meta.file_type();

    if ftype.is_dir() {
        fs::create_dir(dst)?;
        fs::set_permissions(dst, fs::Permissions::from_mode(meta.mode() & 0o7777))?;
        for entry in sorted_entries(src)? {
            copy_node(&entry.path(), &dst.join(entry.file_name()), preserve_owner)?;
        }
    } else if ftype.is_symlink() {
        let target = fs::read_link(src)?;
        std::os::unix::fs::symlink(&target, dst)?;
    } else {
        fs::copy(src, dst)?;
    }

    if preserve_owner {
        lchown(dst, meta.uid(), meta.gid())?;
    }
    // Parent dirs last would also work, but per-node ordering here is
    // already post-order for dirs: children were copied above.
    set_mtime_nofollow(dst, meta.mtime(), meta.mtime_nsec() as u32)?;
    Ok(())
}

/// Removes a path of any kind. Missing paths are not an error (teardown
/// must be idempotent), and read-only interior dirs are made traversable
/// first if a plain removal is refused.
pub fn remove_tree(path: &Path) -> io::Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if !meta.is_dir() {
        return match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        };
    }
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(_) => {
            make_tree_removable(path);
            match fs::remove_dir_all(path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e),
            }
        }
    }
}

fn make_tree_removable(path: &Path) {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return;
    };
    if !meta.is_dir() {
        return;
    }
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o700)) {
        warn!(path = %path.display(), error = %e, "cannot reopen dir for removal");
    }
    if let Ok(entries) = fs::read_dir(path) {
        for entry in entries.flatten() {
            make_tree_removable(&entry.path());
        }
    }
}

/// Strips write bits from every node in a tree. Advisory readonly for
/// placements with no kernel enforcement available.
pub fn chmod_tree_readonly(path: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.file_type().is_symlink() {
        return Ok(());
    }
    if meta.is_dir() {
        for entry in sorted_entries(path)? {
            chmod_tree_readonly(&entry.path())?;
        }
    }
    fs::set_permissions(path, fs::Permissions::from_mode(meta.mode() & 0o7777 & !0o222))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    #[test]
    fn copy_preserves_shape_and_times() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir(&src).unwrap();
        fs::write(src.join("file"), b"data").unwrap();
        symlink("file", src.join("link")).unwrap();
        set_mtime_nofollow(&src.join("file"), 1_262_304_000, 0).unwrap();

        let dst = tmp.path().join("dst");
        copy_tree(&src, &dst).unwrap();

        assert_eq!(fs::read(dst.join("file")).unwrap(), b"data");
        assert_eq!(fs::read_link(dst.join("link")).unwrap().to_str(), Some("file"));
        assert_eq!(fs::symlink_metadata(dst.join("file")).unwrap().mtime(), 1_262_304_000);
    }

    #[test]
    fn remove_tree_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("gone");
        remove_tree(&path).unwrap();
        fs::create_dir(&path).unwrap();
        fs::write(path.join("f"), b"x").unwrap();
        remove_tree(&path).unwrap();
        remove_tree(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn readonly_then_remove() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ro");
        fs::create_dir_all(path.join("sub")).unwrap();
        fs::write(path.join("sub/f"), b"x").unwrap();
        chmod_tree_readonly(&path).unwrap();
        remove_tree(&path).unwrap();
        assert!(!path.exists());
    }
}
