//! Executors: orchestrate materialization → assembly → run → scan →
//! record.
//!
//! The per-job state machine:
//!
//! ```text
//! Created → Prepared → Assembled → Running → Collected → Done
//!                                    ↓
//!                                  Failed
//! ```
//!
//! `start` returns as soon as the job's output streams are wired; the
//! job itself runs asynchronously. Input materializations proceed in
//! parallel (bounded by a configurable cap defaulting to the input
//! count), assembly is single-threaded, and the action is a separate OS
//! process. Teardown of the assembly and all arenas runs on every exit
//! path; a panicking job body is captured and recorded as the catch-all
//! failure kind, never propagated.

mod chroot;
mod run;
mod runc;

pub use chroot::ChrootExecutor;
pub use run::{run_formula, RunOutcome};
pub use runc::RuncExecutor;

use crate::error::{Error, Result};
use crate::filters::{self, HostIdentity};
use crate::formula::Formula;
use crate::runrecord::WareResult;
use crate::transmat::{Arena, TransmatRegistry};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Identifies one job within a workspace.
pub type JobId = String;

/// A caller-supplied stdin source for the action.
pub type StdinSource = Box<dyn Read + Send>;

/// The outcome of one job.
#[derive(Debug)]
pub struct JobResult {
    pub id: JobId,
    /// Exit code of the action; signal deaths map to 128+signal, and a
    /// job that failed before launch reports -1.
    pub exit_code: i32,
    /// Scanned hash per output (conjecture and otherwise).
    pub outputs: BTreeMap<String, WareResult>,
    /// Why the job failed, when it did.
    pub error: Option<Error>,
}

/// A started job. Streams are wired before `start` returns; `wait`
/// blocks until the job is done or failed.
#[derive(Debug)]
pub struct Job {
    id: JobId,
    spool_path: PathBuf,
    cancel: Arc<AtomicBool>,
    wait: tokio::sync::oneshot::Receiver<JobResult>,
}

impl Job {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Path of the multiplexed stdout/stderr spool. Readable while the
    /// job runs (see [`crate::streamer::follow`]) and after it ends.
    pub fn streams_path(&self) -> &Path {
        &self.spool_path
    }

    /// Requests cooperative cancellation. Takes effect at the next
    /// orchestration point before the action launches; a running action
    /// is never killed by the engine.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Waits for the job to reach Done or Failed.
    pub async fn wait(self) -> JobResult {
        match self.wait.await {
            Ok(result) => result,
            Err(_) => JobResult {
                id: self.id,
                exit_code: -1,
                outputs: BTreeMap::new(),
                error: Some(Error::unknown("job task vanished without reporting")),
            },
        }
    }
}

/// A formula execution engine.
#[async_trait]
pub trait Executor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Validates and launches a formula. Returns once the job's streams
    /// are wired.
    async fn start(
        &self,
        formula: Formula,
        job_id: JobId,
        stdin: Option<StdinSource>,
    ) -> Result<Job>;
}

// =============================================================================
// Shared job plumbing
// =============================================================================

/// The workspace root: `$REPRORUN_WORKSPACE`, or the platform temp dir.
pub fn default_workspace() -> PathBuf {
    match std::env::var_os(crate::constants::WORKSPACE_ENV) {
        Some(path) => PathBuf::from(path),
        None => std::env::temp_dir().join(crate::constants::WORKSPACE_DEFAULT_DIR),
    }
}

/// Materializes every input, in parallel waves bounded by `cap`.
///
/// Materialization is at-most-once per input within a run. On any
/// failure the arenas already produced are dropped (and so torn down)
/// and the error of the lexically-first failing input is returned.
pub(crate) fn provision_inputs(
    registry: &TransmatRegistry,
    formula: &Formula,
    cap: Option<usize>,
) -> Result<BTreeMap<String, Arena>> {
    let inputs: Vec<(&String, &crate::formula::Input)> = formula.inputs.iter().collect();
    let cap = cap.unwrap_or(inputs.len()).max(1);

    let mut arenas = BTreeMap::new();
    for wave in inputs.chunks(cap) {
        let results: Vec<(String, Result<Arena>)> = std::thread::scope(|scope| {
            let handles: Vec<_> = wave
                .iter()
                .map(|(name, input)| {
                    let name = (*name).clone();
                    scope.spawn(move || {
                        let arena =
                            registry.materialize(&input.kind, &input.hash, &input.warehouses);
                        (name, arena)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|_| {
                    (
                        String::new(),
                        Err(Error::unknown("materialization thread panicked")),
                    )
                }))
                .collect()
        });
        for (name, outcome) in results {
            match outcome {
                Ok(arena) => {
                    info!(input = %name, hash = arena.hash(), "input materialized");
                    arenas.insert(name, arena);
                }
                Err(e) => return Err(e),
            }
        }
    }
    Ok(arenas)
}

/// Applies each input's filters to its arena.
pub(crate) fn filter_inputs(
    formula: &Formula,
    arenas: &BTreeMap<String, Arena>,
    host: HostIdentity,
) -> Result<()> {
    for (name, input) in &formula.inputs {
        let arena = arenas.get(name).ok_or_else(|| {
            Error::unknown(format!("input {name:?} has no arena"))
        })?;
        let resolved = filters::ResolvedFilters::resolve(&input.filters, host);
        filters::apply(arena.path(), resolved)?;
    }
    Ok(())
}

/// Converts inputs + arenas + escapes into assembly parts.
pub(crate) fn assembly_parts(
    formula: &Formula,
    arenas: &BTreeMap<String, Arena>,
) -> Result<Vec<crate::assembler::AssemblyPart>> {
    let mut parts = Vec::with_capacity(formula.inputs.len() + formula.action.escapes.len());
    for (name, input) in &formula.inputs {
        let arena = arenas
            .get(name)
            .ok_or_else(|| Error::unknown(format!("input {name:?} has no arena")))?;
        let mount = crate::formula::normalize_mount(&input.mount_path).ok_or_else(|| {
            Error::ConfigValidation {
                msg: format!("input {name:?} mount {:?} is invalid", input.mount_path),
            }
        })?;
        parts.push(crate::assembler::AssemblyPart {
            target_path: mount,
            source_path: arena.path().to_path_buf(),
            writable: input.writable,
            host_mount: false,
        });
    }
    for escape in &formula.action.escapes {
        let mount = crate::formula::normalize_mount(&escape.target).ok_or_else(|| {
            Error::ConfigValidation {
                msg: format!("escape target {:?} is invalid", escape.target),
            }
        })?;
        parts.push(crate::assembler::AssemblyPart {
            target_path: mount,
            source_path: PathBuf::from(&escape.source),
            writable: escape.writable,
            host_mount: true,
        });
    }
    Ok(parts)
}

/// Pre-creates each output's directory under the rootfs, owned by the
/// policy identity, so actions can write into their outputs without
/// having to mkdir or chown first.
pub(crate) fn provision_outputs(formula: &Formula, rootfs: &Path) -> Result<()> {
    let (uid, gid) = formula.action.policy.identity();
    for output in formula.outputs.values() {
        let rel = output.mount_path.trim_start_matches('/');
        if rel.is_empty() {
            continue;
        }
        let dir = rootfs.join(rel);
        std::fs::create_dir_all(&dir).map_err(|e| Error::Assembly {
            msg: format!("cannot provision output dir {:?}: {e}", output.mount_path),
        })?;
        if let Err(e) = crate::fsutil::lchown(&dir, uid, gid) {
            // Unprivileged hosts cannot chown; the action then runs as
            // the same user anyway.
            tracing::debug!(dir = %output.mount_path, error = %e, "cannot chown output dir");
        }
    }
    Ok(())
}

/// Applies output filters, scans each output to its hash, and commits
/// the data to the output's warehouses.
pub(crate) fn collect_outputs(
    registry: &TransmatRegistry,
    formula: &Formula,
    rootfs: &Path,
    host: HostIdentity,
) -> Result<BTreeMap<String, WareResult>> {
    let mut results = BTreeMap::new();
    for (name, output) in &formula.outputs {
        let rel = output.mount_path.trim_start_matches('/');
        let subject = rootfs.join(rel);
        let resolved = filters::ResolvedFilters::resolve(&output.filters, host);
        filters::apply(&subject, resolved)?;
        let hash = registry.scan(&output.kind, &subject, &output.warehouses)?;
        info!(output = %name, hash = %hash, "output collected");
        results.insert(
            name.clone(),
            WareResult {
                kind: output.kind.clone(),
                hash,
            },
        );
    }
    Ok(results)
}

/// Runs a fallible job body, capturing panics as the catch-all error.
pub(crate) fn catch_job_panic<T>(
    body: impl FnOnce() -> Result<T> + std::panic::UnwindSafe,
) -> Result<T> {
    match std::panic::catch_unwind(body) {
        Ok(outcome) => outcome,
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "job panicked".to_string());
            Err(Error::unknown(msg))
        }
    }
}
