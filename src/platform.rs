//! Host capability detection.
//!
//! Probes run once at executor startup and select which placers are
//! usable. Probes are cheap (an id read and a /proc scan) and never
//! panic; a failed probe simply reports the capability absent.

#[cfg(target_os = "linux")]
use crate::fsutil;
use std::collections::HashSet;
#[cfg(target_os = "linux")]
use std::fs;

/// Capabilities that affect placer availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// mount(2) is usable (effectively: running privileged on Linux).
    Mounts,
    /// An overlay union filesystem is available in the kernel.
    Overlay,
}

/// Detected host capabilities.
#[derive(Debug, Clone)]
pub struct Platform {
    capabilities: HashSet<Capability>,
}

impl Platform {
    /// Probes the current host.
    pub fn detect() -> Platform {
        let mut capabilities = HashSet::new();

        #[cfg(target_os = "linux")]
        {
            if fsutil::effective_uid() == 0 {
                capabilities.insert(Capability::Mounts);
                if kernel_has_overlay() {
                    capabilities.insert(Capability::Overlay);
                }
            }
        }

        Platform { capabilities }
    }

    /// A platform with no kernel capabilities; everything falls back to
    /// copying. Useful in tests.
    pub fn bare() -> Platform {
        Platform {
            capabilities: HashSet::new(),
        }
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Whether the running kernel lists an overlay filesystem.
#[cfg(target_os = "linux")]
fn kernel_has_overlay() -> bool {
    fs::read_to_string("/proc/filesystems")
        .map(|list| {
            list.lines()
                .any(|line| line.trim_end().ends_with("overlay") || line.trim_end().ends_with("aufs"))
        })
        .unwrap_or(false)
}
