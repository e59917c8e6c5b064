//! The copying placer. Always available; provides source isolation by
//! construction (writes at the target never reach the source). Readonly
//! here is advisory: write bits are stripped, but a sufficiently
//! privileged process can still write.

use super::{Cleanup, Placement, Placer};
use crate::error::{Error, Result};
use crate::fsutil;
use std::path::Path;
use tracing::debug;

pub struct CopyPlacer;

impl CopyPlacer {
    pub fn new() -> CopyPlacer {
        CopyPlacer
    }
}

impl Default for CopyPlacer {
    fn default() -> Self {
        Self::new()
    }
}

impl Placer for CopyPlacer {
    fn name(&self) -> &'static str {
        "copy"
    }

    fn place(&self, source: &Path, target: &Path, writable: bool) -> Result<Placement> {
        // An existing target is consumed: the placement's content is the
        // only thing visible there afterwards.
        fsutil::remove_tree(target).map_err(|e| place_err(source, target, &e))?;
        fsutil::copy_tree(source, target).map_err(|e| place_err(source, target, &e))?;
        if !writable {
            fsutil::chmod_tree_readonly(target).map_err(|e| place_err(source, target, &e))?;
        }
        debug!(source = %source.display(), target = %target.display(), writable, "copy placement");
        Ok(Placement {
            target: target.to_path_buf(),
            cleanup: Cleanup::RemoveTree,
            done: false,
        })
    }
}

fn place_err(source: &Path, target: &Path, e: &std::io::Error) -> Error {
    Error::Assembly {
        msg: format!(
            "cannot copy {} onto {}: {e}",
            source.display(),
            target.display()
        ),
    }
}
