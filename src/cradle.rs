//! Cradle: standard scaffolding injected into a rootfs before launch.
//!
//! Content-addressed inputs say nothing about the handful of paths most
//! software assumes exist. When a formula leaves the cradle enabled (the
//! default), the executor manifests a world-writable `/tmp`, minimal
//! `/etc/passwd` and `/etc/group` entries covering the policy identity,
//! and the identity's home directory. Files already provided by an
//! input are left untouched.

use crate::error::{Error, Result};
use crate::formula::Policy;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::debug;

/// Builds the cradle inside `rootfs` for the given policy identity.
pub fn make_cradle(rootfs: &Path, policy: Policy) -> Result<()> {
    let (uid, gid) = policy.identity();

    let tmp = rootfs.join("tmp");
    if !tmp.exists() {
        fs::create_dir(&tmp).map_err(|e| cradle_err("/tmp", &e))?;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o1777))
            .map_err(|e| cradle_err("/tmp", &e))?;
    }

    let etc = rootfs.join("etc");
    if !etc.exists() {
        fs::create_dir(&etc).map_err(|e| cradle_err("/etc", &e))?;
    }

    let passwd = etc.join("passwd");
    if !passwd.exists() {
        let mut contents = String::from("root:x:0:0:root:/root:/bin/sh\n");
        if uid != 0 {
            contents.push_str(&format!("user:x:{uid}:{gid}:user:/home/user:/bin/sh\n"));
        }
        fs::write(&passwd, contents).map_err(|e| cradle_err("/etc/passwd", &e))?;
    }

    let group = etc.join("group");
    if !group.exists() {
        let mut contents = String::from("root:x:0:\n");
        if gid != 0 {
            contents.push_str(&format!("user:x:{gid}:\n"));
        }
        fs::write(&group, contents).map_err(|e| cradle_err("/etc/group", &e))?;
    }

    let home = if uid == 0 {
        rootfs.join("root")
    } else {
        rootfs.join("home/user")
    };
    if !home.exists() {
        fs::create_dir_all(&home).map_err(|e| cradle_err("home", &e))?;
        fs::set_permissions(&home, fs::Permissions::from_mode(0o755))
            .map_err(|e| cradle_err("home", &e))?;
        if let Err(e) = crate::fsutil::lchown(&home, uid, gid) {
            // Unprivileged hosts cannot chown; the dir still exists.
            debug!(error = %e, "cannot chown cradle home dir");
        }
    }

    Ok(())
}

fn cradle_err(what: &str, e: &std::io::Error) -> Error {
    Error::Assembly {
        msg: format!("cannot manifest cradle {what}: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn manifests_standard_paths() {
        let tmp = TempDir::new().unwrap();
        make_cradle(tmp.path(), Policy::Routine).unwrap();

        assert!(tmp.path().join("tmp").is_dir());
        let passwd = fs::read_to_string(tmp.path().join("etc/passwd")).unwrap();
        assert!(passwd.contains("root:x:0:0"));
        assert!(passwd.contains("user:x:1000:1000"));
        assert!(tmp.path().join("home/user").is_dir());

        let mode = fs::metadata(tmp.path().join("tmp")).unwrap().permissions().mode();
        assert_eq!(mode & 0o7777, 0o1777);
    }

    #[test]
    fn existing_files_left_alone() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("etc")).unwrap();
        fs::write(tmp.path().join("etc/passwd"), "custom:x:42:42::/:/bin/sh\n").unwrap();

        make_cradle(tmp.path(), Policy::Governor).unwrap();
        let passwd = fs::read_to_string(tmp.path().join("etc/passwd")).unwrap();
        assert_eq!(passwd, "custom:x:42:42::/:/bin/sh\n");
    }
}
