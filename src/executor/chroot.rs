//! The chroot executor: isolation via chroot(2) plus a credential drop.
//!
//! Requires privileges (chroot and setuid are root-only); the engine's
//! cheapest isolation flavor. The action sees exactly the assembled
//! rootfs, the formula's exact environment, and the policy's numeric
//! identity — nothing is inherited from the host.

use super::{Executor, Job, JobId, JobResult, StdinSource};
use crate::assembler;
use crate::constants::{JOB_DIR, ROOTFS_DIR, STREAM_SPOOL_FILE};
use crate::cradle;
use crate::error::{Error, Result};
use crate::filters::HostIdentity;
use crate::formula::Formula;
use crate::placer::PlacerSet;
use crate::platform::Platform;
use crate::runrecord::WareResult;
use crate::streamer::{StreamMux, STREAM_STDERR, STREAM_STDOUT};
use crate::transmat::TransmatRegistry;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

pub struct ChrootExecutor {
    workspace: PathBuf,
    registry: Arc<TransmatRegistry>,
    placers: Arc<PlacerSet>,
    host: HostIdentity,
    materialize_concurrency: Option<usize>,
}

impl ChrootExecutor {
    /// Sets up an executor rooted at `workspace`. Capabilities are
    /// probed once, here; the host identity for `host` filters is
    /// captured now, before any later privilege handling.
    pub fn new(workspace: PathBuf) -> Result<ChrootExecutor> {
        fs::create_dir_all(&workspace).map_err(Error::unknown)?;
        let registry = TransmatRegistry::standard(&workspace.join("stage"))?;
        let platform = Platform::detect();
        let placers = PlacerSet::detect(&platform, &workspace.join("scrap"))?;
        Ok(ChrootExecutor {
            workspace,
            registry: Arc::new(registry),
            placers: Arc::new(placers),
            host: HostIdentity::capture(),
            materialize_concurrency: None,
        })
    }

    /// Caps how many inputs materialize at once. Default: all of them.
    pub fn with_materialize_concurrency(mut self, cap: usize) -> ChrootExecutor {
        self.materialize_concurrency = Some(cap);
        self
    }
}

#[async_trait]
impl Executor for ChrootExecutor {
    fn name(&self) -> &'static str {
        "chroot"
    }

    async fn start(
        &self,
        mut formula: Formula,
        job_id: JobId,
        stdin: Option<StdinSource>,
    ) -> Result<Job> {
        formula.validate()?;
        formula.apply_defaults();

        let job_dir = self.workspace.join(JOB_DIR).join(&job_id);
        fs::create_dir_all(&job_dir).map_err(Error::unknown)?;
        // The spool outlives the job scratch dir so callers can read
        // streams after completion.
        let spool_path = self.workspace.join(JOB_DIR).join(format!("{job_id}.{STREAM_SPOOL_FILE}"));
        let mux = StreamMux::create(&spool_path).map_err(Error::unknown)?;

        let cancel = Arc::new(AtomicBool::new(false));
        let (tx, rx) = tokio::sync::oneshot::channel();

        let registry = Arc::clone(&self.registry);
        let placers = Arc::clone(&self.placers);
        let host = self.host;
        let cap = self.materialize_concurrency;
        let cancel_flag = Arc::clone(&cancel);
        let id = job_id.clone();

        tokio::task::spawn_blocking(move || {
            let mut result = JobResult {
                id: id.clone(),
                exit_code: -1,
                outputs: BTreeMap::new(),
                error: None,
            };
            let outcome = super::catch_job_panic(std::panic::AssertUnwindSafe(|| {
                execute(
                    &registry, &placers, host, cap, &formula, &job_dir, stdin, &mux, &cancel_flag,
                )
            }));
            match outcome {
                Ok((exit_code, outputs)) => {
                    result.exit_code = exit_code;
                    result.outputs = outputs;
                }
                Err(e) => result.error = Some(e),
            }
            if let Err(e) = mux.close() {
                warn!(job = %id, error = %e, "stream spool close failed");
            }
            if let Err(e) = crate::fsutil::remove_tree(&job_dir) {
                warn!(job = %id, error = %e, "job dir teardown failed");
            }
            info!(job = %id, exit_code = result.exit_code, failed = result.error.is_some(), "job complete");
            let _ = tx.send(result);
        });

        Ok(Job {
            id: job_id,
            spool_path,
            cancel,
            wait: rx,
        })
    }
}

/// The job body. Runs under the panic sink; teardown of arenas and the
/// assembly happens on every path out.
#[allow(clippy::too_many_arguments)]
fn execute(
    registry: &TransmatRegistry,
    placers: &PlacerSet,
    host: HostIdentity,
    cap: Option<usize>,
    formula: &Formula,
    job_dir: &Path,
    stdin: Option<StdinSource>,
    mux: &StreamMux,
    cancel: &AtomicBool,
) -> Result<(i32, BTreeMap<String, WareResult>)> {
    // Prepared → Assembled.
    let mut arenas = super::provision_inputs(registry, formula, cap)?;
    super::filter_inputs(formula, &arenas, host)?;

    if cancel.load(Ordering::Relaxed) {
        return Err(Error::TaskExec {
            msg: "job cancelled before launch".to_string(),
        });
    }

    let rootfs = job_dir.join(ROOTFS_DIR);
    let parts = super::assembly_parts(formula, &arenas)?;
    let mut assembly = assembler::assemble(&rootfs, parts, placers)?;

    // Running → Collected, with unconditional teardown after.
    let run_outcome = (|| {
        super::provision_outputs(formula, &rootfs)?;
        if formula.action.cradle_enabled() {
            cradle::make_cradle(&rootfs, formula.action.policy)?;
        }
        let exit_code = launch(&rootfs, formula, stdin, mux)?;
        let outputs = super::collect_outputs(registry, formula, &rootfs, host)?;
        Ok((exit_code, outputs))
    })();

    assembly.teardown();
    for arena in arenas.values_mut() {
        arena.teardown();
    }
    run_outcome
}

/// Launches the action chrooted into the rootfs with the policy
/// identity, exact env, and wired streams. Blocks until exit.
fn launch(
    rootfs: &Path,
    formula: &Formula,
    stdin: Option<StdinSource>,
    mux: &StreamMux,
) -> Result<i32> {
    let action = &formula.action;
    let cwd = &action.cwd;

    // The cwd check happens out here where we can still see the rootfs;
    // after chroot the error would be indistinguishable from exec noise.
    let cwd_in_root = rootfs.join(cwd.trim_start_matches('/'));
    match fs::metadata(&cwd_in_root) {
        Err(e) => {
            return Err(Error::NoSuchCwd {
                cwd: cwd.clone(),
                msg: e.to_string(),
            })
        }
        Ok(meta) if !meta.is_dir() => {
            return Err(Error::NoSuchCwd {
                cwd: cwd.clone(),
                msg: "not a directory".to_string(),
            })
        }
        Ok(_) => {}
    }

    let (uid, gid) = action.policy.identity();
    let rootfs_c = CString::new(rootfs.as_os_str().as_bytes()).map_err(Error::unknown)?;
    let cwd_c = CString::new(cwd.as_bytes()).map_err(Error::unknown)?;

    let mut cmd = Command::new(&action.entrypoint[0]);
    cmd.args(&action.entrypoint[1..]);
    cmd.env_clear();
    cmd.envs(&action.env);
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    // SAFETY: only async-signal-safe calls between fork and exec.
    unsafe {
        cmd.pre_exec(move || {
            if libc::chroot(rootfs_c.as_ptr()) != 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::chdir(cwd_c.as_ptr()) != 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::setgroups(0, std::ptr::null()) != 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::setgid(gid) != 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::setuid(uid) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    info!(entrypoint = ?action.entrypoint, uid, gid, "beginning execution");
    let mut child = cmd.spawn().map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => Error::NoSuchCommand {
            cmd: action.entrypoint[0].clone(),
        },
        _ => Error::TaskExec {
            msg: format!("cannot launch {:?}: {e}", action.entrypoint[0]),
        },
    })?;

    // Pump streams on plain threads; each handle is owned by its pump.
    let mut pumps = Vec::new();
    if let Some(mut source) = stdin {
        let mut sink = child.stdin.take().expect("stdin was piped");
        pumps.push(std::thread::spawn(move || {
            let _ = io::copy(&mut source, &mut sink);
        }));
    }
    if let Some(mut out) = child.stdout.take() {
        let mut appender = mux.appender(STREAM_STDOUT);
        pumps.push(std::thread::spawn(move || {
            let _ = io::copy(&mut out, &mut appender);
        }));
    }
    if let Some(mut err) = child.stderr.take() {
        let mut appender = mux.appender(STREAM_STDERR);
        pumps.push(std::thread::spawn(move || {
            let _ = io::copy(&mut err, &mut appender);
        }));
    }

    let status = child.wait().map_err(|e| Error::TaskExec {
        msg: format!("waiting on action failed: {e}"),
    })?;
    for pump in pumps {
        let _ = pump.join();
    }

    let exit_code = status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0));
    info!(exit_code, "execution done");
    Ok(exit_code)
}
