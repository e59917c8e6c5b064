//! The `git` transmat: wares are commits, hashes are commit ids.
//!
//! Materialization plonks down the contents of one commit as a
//! filesystem. The `.git` directory is not part of the ware: the bare
//! clone lives beside the work tree in the staging area and is torn
//! down with it.
//!
//! Git is a lossy transport: permissions are only loosely respected
//! (execute bit only), timestamps are undefined, ownership and xattrs
//! are not tracked, and empty directories cannot be transmitted. A
//! materialized work tree is *consistent*, but callers who need pinned
//! attributes must configure filters. Scanning is not supported.

use super::{Arena, Transmat};
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};

#[derive(Debug)]
pub struct GitTransmat {
    stage: PathBuf,
}

impl GitTransmat {
    pub fn new(stage_root: PathBuf) -> Result<GitTransmat> {
        Ok(GitTransmat {
            stage: super::init_stage(stage_root)?,
        })
    }

    /// A git invocation with host configuration pinned off, so host
    /// gitconfig cannot perturb materialization.
    fn git(&self) -> Command {
        let mut cmd = Command::new("git");
        cmd.env("GIT_CONFIG_NOSYSTEM", "true");
        cmd.env("HOME", "/dev/null");
        cmd
    }

    /// Pings one remote. Reachability is `ls-remote` answering at all.
    fn ping(&self, uri: &str) -> bool {
        self.git()
            .args(["ls-remote", "--", uri])
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false)
    }
}

impl Transmat for GitTransmat {
    fn materialize(&self, kind: &str, hash: &str, warehouses: &[String]) -> Result<Arena> {
        self.check_kind(kind)?;
        if !looks_like_commit(hash) {
            return Err(Error::ConfigValidation {
                msg: format!("{hash:?} is not a git commit id"),
            });
        }

        let mut remote = None;
        for uri in warehouses {
            if self.ping(uri) {
                info!(uri = %uri, "git remote selected");
                remote = Some(uri.as_str());
                break;
            }
            info!(uri = %uri, "git remote unavailable, skipping");
        }
        let Some(remote) = remote else {
            return Err(Error::WarehouseUnavailable {
                hash: hash.to_string(),
            });
        };

        let stage = tempfile::tempdir_in(&self.stage).map_err(Error::unknown)?;
        let git_dir = stage.path().join("git");
        let work_tree = stage.path().join("tree");
        std::fs::create_dir(&work_tree).map_err(Error::unknown)?;

        let clone = self
            .git()
            .args(["clone", "--bare", "--", remote])
            .arg(&git_dir)
            .output()
            .map_err(Error::unknown)?;
        if !clone.status.success() {
            return Err(Error::WarehouseProblem {
                msg: format!("git clone failed: {}", String::from_utf8_lossy(&clone.stderr)),
                uris: vec![remote.to_string()],
            });
        }

        let checkout = self
            .git()
            .env("GIT_DIR", &git_dir)
            .env("GIT_WORK_TREE", &work_tree)
            .current_dir(&work_tree)
            .args(["checkout", hash])
            .output()
            .map_err(Error::unknown)?;
        if !checkout.status.success() {
            let stderr = String::from_utf8_lossy(&checkout.stderr);
            if stderr.contains("reference is not a tree") || stderr.contains("did not match any") {
                return Err(Error::WareDne {
                    hash: hash.to_string(),
                });
            }
            return Err(Error::WareCorrupt {
                hash: hash.to_string(),
                msg: format!("git checkout failed: {stderr}"),
            });
        }

        let submodules = self
            .git()
            .env("GIT_DIR", &git_dir)
            .env("GIT_WORK_TREE", &work_tree)
            .current_dir(&work_tree)
            .args(["submodule", "update", "--init"])
            .output()
            .map_err(Error::unknown)?;
        if !submodules.status.success() {
            warn!(
                hash,
                stderr = %String::from_utf8_lossy(&submodules.stderr),
                "submodule update failed; work tree may be partial"
            );
        }

        // No separate verification step: checkout of the named commit is
        // the integrity check, since the commit id is the content hash.
        info!(hash, remote, "git ware materialized");
        let kept = stage.into_path();
        Ok(Arena::with_scrap(kept.join("tree"), hash.to_string(), kept))
    }

    fn scan(&self, kind: &str, _subject: &Path, _warehouses: &[String]) -> Result<String> {
        self.check_kind(kind)?;
        Err(Error::ConfigValidation {
            msg: "the git kind does not support scanning".to_string(),
        })
    }

    fn kind(&self) -> &'static str {
        "git"
    }
}

/// Commit ids are hex, full or abbreviated; anything else could smuggle
/// flags or refspec syntax into the checkout invocation.
fn looks_like_commit(hash: &str) -> bool {
    hash.len() >= 4 && hash.len() <= 64 && hash.chars().all(|c| c.is_ascii_hexdigit())
}
