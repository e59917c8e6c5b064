//! Assembler and placer compliance tests.
//!
//! The copy placer path runs everywhere. Bind and overlay placements
//! need mount(2) privileges, so those checks detect the capability at
//! runtime and skip quietly when the host cannot exercise them.

use reprorun::assembler::{assemble, AssemblyPart};
use reprorun::placer::{BindPlacer, OverlayPlacer, Placer, PlacerSet};
use reprorun::platform::{Capability, Platform};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn fixture(base: &Path, name: &str, files: &[&str]) -> PathBuf {
    let root = base.join(name);
    fs::create_dir_all(&root).unwrap();
    for file in files {
        fs::write(root.join(file), file.as_bytes()).unwrap();
    }
    root
}

fn part(target: &str, source: &Path, writable: bool) -> AssemblyPart {
    AssemblyPart {
        target_path: target.to_string(),
        source_path: source.to_path_buf(),
        writable,
        host_mount: false,
    }
}

fn mounts_available() -> bool {
    Platform::detect().has(Capability::Mounts)
}

// =============================================================================
// Copy Placer Compliance (runs everywhere)
// =============================================================================

#[test]
fn copy_assembly_gets_data_into_place() {
    let tmp = TempDir::new().unwrap();
    let alpha = fixture(tmp.path(), "alpha", &["base"]);
    let beta = fixture(tmp.path(), "beta", &["1", "2", "3"]);
    let rootfs = tmp.path().join("assembled");

    let parts = vec![part("/", &alpha, true), part("/data/test", &beta, true)];
    let mut assembly = assemble(&rootfs, parts, &PlacerSet::copy_only()).unwrap();

    assert!(rootfs.join("base").exists());
    for f in ["1", "2", "3"] {
        assert!(rootfs.join("data/test").join(f).exists());
    }
    assembly.teardown();
    assert!(!rootfs.exists());
}

#[test]
fn copy_assembly_isolates_source() {
    let tmp = TempDir::new().unwrap();
    let alpha = fixture(tmp.path(), "alpha", &["base"]);
    let rootfs = tmp.path().join("assembled");

    let mut assembly = assemble(
        &rootfs,
        vec![part("/", &alpha, true)],
        &PlacerSet::copy_only(),
    )
    .unwrap();

    fs::write(rootfs.join("newfile"), b"mutation").unwrap();
    assert!(
        !alpha.join("newfile").exists(),
        "write at target must not reach source"
    );
    assembly.teardown();
}

#[test]
fn teardown_happens_in_reverse_order() {
    let tmp = TempDir::new().unwrap();
    let alpha = fixture(tmp.path(), "alpha", &["base"]);
    let beta = fixture(tmp.path(), "beta", &["leaf"]);
    let rootfs = tmp.path().join("assembled");

    let parts = vec![part("/", &alpha, true), part("/deep/nest", &beta, true)];
    let mut assembly = assemble(&rootfs, parts, &PlacerSet::copy_only()).unwrap();
    assert!(rootfs.join("deep/nest/leaf").exists());

    // If the root placement tore down first, removing the nested
    // placement would fail against a missing tree; reverse order makes
    // this clean.
    assembly.teardown();
    assert!(!rootfs.exists());
}

#[test]
fn shallowest_placement_goes_first_regardless_of_list_order() {
    let tmp = TempDir::new().unwrap();
    let alpha = fixture(tmp.path(), "alpha", &["base"]);
    let beta = fixture(tmp.path(), "beta", &["leaf"]);
    let rootfs = tmp.path().join("assembled");

    let parts = vec![part("/nested", &beta, true), part("/", &alpha, true)];
    let mut assembly = assemble(&rootfs, parts, &PlacerSet::copy_only()).unwrap();
    // Both trees visible: the root placement did not bury /nested.
    assert!(rootfs.join("base").exists());
    assert!(rootfs.join("nested/leaf").exists());
    assembly.teardown();
}

#[test]
fn symlinked_placement_target_is_refused() {
    let tmp = TempDir::new().unwrap();
    let alpha = fixture(tmp.path(), "alpha", &["base"]);
    std::os::unix::fs::symlink("/", tmp.path().join("alpha/absolute")).unwrap();
    let beta = fixture(tmp.path(), "beta", &["leaf"]);
    let rootfs = tmp.path().join("assembled");

    let parts = vec![
        part("/", &alpha, true),
        part("/absolute/payload", &beta, true),
    ];
    let err = assemble(&rootfs, parts, &PlacerSet::copy_only()).unwrap_err();
    assert_eq!(err.kind(), "ErrAssembly");
}

// =============================================================================
// Bind Placer Compliance (requires mount privileges)
// =============================================================================

#[test]
fn bind_placement_enforces_readonly() {
    if !mounts_available() {
        eprintln!("skipping: mount privileges unavailable");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let source = fixture(tmp.path(), "src", &["present"]);
    let target = tmp.path().join("dst");

    let mut placement = BindPlacer::new().place(&source, &target, false).unwrap();
    assert!(target.join("present").exists());

    let err = fs::write(target.join("newfile"), b"x").unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EROFS));

    placement.teardown();
    assert!(!target.join("present").exists() || fs::read_dir(&target).unwrap().count() == 0);
}

#[test]
fn bind_placement_is_not_isolating() {
    if !mounts_available() {
        eprintln!("skipping: mount privileges unavailable");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let source = fixture(tmp.path(), "src", &["present"]);
    let target = tmp.path().join("dst");

    let mut placement = BindPlacer::new().place(&source, &target, true).unwrap();
    fs::write(target.join("newfile"), b"x").unwrap();
    assert!(source.join("newfile").exists(), "bind shares the source");
    placement.teardown();
}

// =============================================================================
// Overlay Placer Compliance (requires union fs support)
// =============================================================================

#[test]
fn overlay_placement_isolates_source() {
    let platform = Platform::detect();
    if !platform.has(Capability::Overlay) {
        eprintln!("skipping: overlay unavailable");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let source = fixture(tmp.path(), "src", &["present"]);
    let target = tmp.path().join("dst");
    let placer = OverlayPlacer::new(tmp.path().join("scrap")).unwrap();

    let mut placement = placer.place(&source, &target, true).unwrap();
    assert!(target.join("present").exists());

    fs::write(target.join("newfile"), b"x").unwrap();
    assert!(
        !source.join("newfile").exists(),
        "upper layer must absorb writes"
    );
    placement.teardown();
    assert!(!target.join("newfile").exists());
}
