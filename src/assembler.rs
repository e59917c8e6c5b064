//! The assembler: composes a rootfs from ordered placements.
//!
//! Parts are placed shallowest-first (the `/` mount always first), so a
//! placement at `/a` is visible beneath a later placement at `/a/b`.
//! Parent directories missing from the tree are manifested with mode
//! 0755 and left for later placements to cover. Placement targets that
//! would resolve through a symlink are refused: a symlink planted by one
//! input must never redirect where another input lands.
//!
//! The assembly holds its placements in a LIFO stack and tears them down
//! in reverse order. Teardown is the only safe way to release the
//! composed tree and must run on every exit path, including a panicking
//! action; failures during teardown are logged, never raised.

use crate::error::{Error, Result};
use crate::placer::{Placement, PlacerSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One part of an assembly: make `source_path` appear at `target_path`.
#[derive(Debug, Clone)]
pub struct AssemblyPart {
    /// Normalized absolute mount path inside the rootfs.
    pub target_path: String,
    /// Host location of the tree to place.
    pub source_path: PathBuf,
    pub writable: bool,
    /// Host-mount escape: expose the live host tree rather than an
    /// isolated arena.
    pub host_mount: bool,
}

/// A composed rootfs plus its teardown handle.
#[derive(Debug)]
pub struct Assembly {
    rootfs: PathBuf,
    placements: Vec<Placement>,
    torn_down: bool,
}

impl Assembly {
    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    /// Releases all placements, most recent first.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        while let Some(mut placement) = self.placements.pop() {
            placement.teardown();
        }
    }
}

impl Drop for Assembly {
    fn drop(&mut self) {
        if !self.torn_down {
            warn!(rootfs = %self.rootfs.display(), "assembly dropped without teardown");
            self.teardown();
        }
    }
}

/// Assembles a rootfs at `rootfs` from `parts`.
///
/// On failure, everything placed so far is torn down before the error
/// returns.
pub fn assemble(rootfs: &Path, mut parts: Vec<AssemblyPart>, placers: &PlacerSet) -> Result<Assembly> {
    // Shallowest-first; ties broken lexically for a deterministic order.
    parts.sort_by(|a, b| {
        let depth = |p: &str| p.split('/').filter(|c| !c.is_empty()).count();
        depth(&a.target_path)
            .cmp(&depth(&b.target_path))
            .then_with(|| a.target_path.cmp(&b.target_path))
    });

    fs::create_dir_all(rootfs).map_err(|e| Error::Assembly {
        msg: format!("cannot create rootfs {}: {e}", rootfs.display()),
    })?;

    let mut assembly = Assembly {
        rootfs: rootfs.to_path_buf(),
        placements: Vec::with_capacity(parts.len()),
        torn_down: false,
    };

    for part in &parts {
        match place_part(&mut assembly, part, placers) {
            Ok(()) => {}
            Err(e) => {
                assembly.teardown();
                return Err(e);
            }
        }
    }
    Ok(assembly)
}

fn place_part(assembly: &mut Assembly, part: &AssemblyPart, placers: &PlacerSet) -> Result<()> {
    let target = resolve_target(&assembly.rootfs, &part.target_path)?;

    let placer = if part.host_mount {
        placers.for_escape()?
    } else {
        placers.for_arena(part.writable)
    };
    debug!(
        target = %part.target_path,
        source = %part.source_path.display(),
        placer = placer.name(),
        "placing"
    );
    let placement = placer.place(&part.source_path, &target, part.writable)?;
    assembly.placements.push(placement);
    Ok(())
}

/// Maps a mount path to its location under the rootfs, manifesting
/// missing parent directories and refusing symlinks anywhere along the
/// way.
fn resolve_target(rootfs: &Path, mount: &str) -> Result<PathBuf> {
    if mount == "/" {
        return Ok(rootfs.to_path_buf());
    }

    let mut current = rootfs.to_path_buf();
    let components: Vec<&str> = mount.split('/').filter(|c| !c.is_empty()).collect();
    for (i, component) in components.iter().enumerate() {
        current = current.join(component);
        let meta = fs::symlink_metadata(&current);
        match meta {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(Error::Assembly {
                    msg: format!(
                        "placement target {mount:?} resolves through a symlink at {:?}",
                        format!("/{}", components[..=i].join("/"))
                    ),
                });
            }
            Ok(_) => {}
            Err(_) => {
                // Manifest the implicit dir unless this is the final
                // component, which the placer itself creates or covers.
                if i + 1 < components.len() {
                    fs::create_dir(&current).map_err(|e| Error::Assembly {
                        msg: format!("cannot manifest {}: {e}", current.display()),
                    })?;
                    set_mode_0755(&current);
                }
            }
        }
    }
    Ok(current)
}

fn set_mode_0755(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o755)) {
        warn!(path = %path.display(), error = %e, "cannot set implicit dir mode");
    }
}
