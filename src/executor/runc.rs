//! The container-runtime executor: emits an OCI runtime spec for the
//! assembled rootfs and execs an external runtime binary (`runc` or a
//! drop-in replacement).
//!
//! Error mapping is necessarily coarser than the chroot flavor: the
//! runtime proxies the exec, so most in-container launch failures
//! surface only as the runtime's own exit status and stderr noise.
//! What we can distinguish:
//!
//! - runtime binary missing on the host → `ErrTaskExec`
//! - runtime killed by the host → `ErrTaskExec`
//! - everything the runtime reports → the action's exit code, with the
//!   runtime's stderr in the job's stderr stream
//!
//! The cwd pre-check still happens host-side against the assembled
//! rootfs, so `ErrNoSuchCwd` keeps its meaning here.

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
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

pub struct RuncExecutor {
    workspace: PathBuf,
    runtime_bin: String,
    registry: Arc<TransmatRegistry>,
    placers: Arc<PlacerSet>,
    host: HostIdentity,
}

impl RuncExecutor {
    pub fn new(workspace: PathBuf) -> Result<RuncExecutor> {
        Self::with_runtime(workspace, "runc")
    }

    /// Uses a specific runtime binary (crun, youki, ...).
    pub fn with_runtime(workspace: PathBuf, runtime_bin: &str) -> Result<RuncExecutor> {
        fs::create_dir_all(&workspace).map_err(Error::unknown)?;
        let registry = TransmatRegistry::standard(&workspace.join("stage"))?;
        let platform = Platform::detect();
        let placers = PlacerSet::detect(&platform, &workspace.join("scrap"))?;
        Ok(RuncExecutor {
            workspace,
            runtime_bin: runtime_bin.to_string(),
            registry: Arc::new(registry),
            placers: Arc::new(placers),
            host: HostIdentity::capture(),
        })
    }
}

#[async_trait]
impl Executor for RuncExecutor {
    fn name(&self) -> &'static str {
        "runc"
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
        let spool_path = self.workspace.join(JOB_DIR).join(format!("{job_id}.{STREAM_SPOOL_FILE}"));
        let mux = StreamMux::create(&spool_path).map_err(Error::unknown)?;

        let cancel = Arc::new(AtomicBool::new(false));
        let (tx, rx) = tokio::sync::oneshot::channel();

        let registry = Arc::clone(&self.registry);
        let placers = Arc::clone(&self.placers);
        let host = self.host;
        let runtime_bin = self.runtime_bin.clone();
        let runtime_root = self.workspace.join("runtime-state");
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
                    &registry,
                    &placers,
                    host,
                    &runtime_bin,
                    &runtime_root,
                    &formula,
                    &id,
                    &job_dir,
                    stdin,
                    &mux,
                    &cancel_flag,
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

#[allow(clippy::too_many_arguments)]
fn execute(
    registry: &TransmatRegistry,
    placers: &PlacerSet,
    host: HostIdentity,
    runtime_bin: &str,
    runtime_root: &Path,
    formula: &Formula,
    job_id: &str,
    job_dir: &Path,
    stdin: Option<StdinSource>,
    mux: &StreamMux,
    cancel: &AtomicBool,
) -> Result<(i32, BTreeMap<String, WareResult>)> {
    let mut arenas = super::provision_inputs(registry, formula, None)?;
    super::filter_inputs(formula, &arenas, host)?;

    if cancel.load(Ordering::Relaxed) {
        return Err(Error::TaskExec {
            msg: "job cancelled before launch".to_string(),
        });
    }

    let rootfs = job_dir.join(ROOTFS_DIR);
    let parts = super::assembly_parts(formula, &arenas)?;
    let mut assembly = assembler::assemble(&rootfs, parts, placers)?;

    let run_outcome = (|| {
        super::provision_outputs(formula, &rootfs)?;
        if formula.action.cradle_enabled() {
            cradle::make_cradle(&rootfs, formula.action.policy)?;
        }

        let cwd_in_root = rootfs.join(formula.action.cwd.trim_start_matches('/'));
        if !cwd_in_root.is_dir() {
            return Err(Error::NoSuchCwd {
                cwd: formula.action.cwd.clone(),
                msg: "not a directory inside rootfs".to_string(),
            });
        }

        let spec = emit_runtime_spec(formula);
        let spec_json = serde_json::to_vec_pretty(&spec).map_err(Error::unknown)?;
        fs::write(job_dir.join("config.json"), spec_json).map_err(Error::unknown)?;

        let exit_code = launch(runtime_bin, runtime_root, job_id, job_dir, stdin, mux)?;
        let outputs = super::collect_outputs(registry, formula, &rootfs, host)?;
        Ok((exit_code, outputs))
    })();

    assembly.teardown();
    for arena in arenas.values_mut() {
        arena.teardown();
    }
    run_outcome
}

fn launch(
    runtime_bin: &str,
    runtime_root: &Path,
    job_id: &str,
    bundle: &Path,
    stdin: Option<StdinSource>,
    mux: &StreamMux,
) -> Result<i32> {
    let mut cmd = Command::new(runtime_bin);
    cmd.arg("--root")
        .arg(runtime_root)
        .arg("run")
        .arg("--bundle")
        .arg(bundle)
        .arg(job_id);
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    info!(runtime = runtime_bin, job = job_id, "invoking container runtime");
    let mut child = cmd.spawn().map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => Error::TaskExec {
            msg: format!("runtime binary {runtime_bin:?} is missing"),
        },
        _ => Error::TaskExec {
            msg: format!("cannot launch runtime {runtime_bin:?}: {e}"),
        },
    })?;

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
        msg: format!("waiting on runtime failed: {e}"),
    })?;
    for pump in pumps {
        let _ = pump.join();
    }

    use std::os::unix::process::ExitStatusExt;
    Ok(status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0)))
}

// =============================================================================
// Runtime spec emission
// =============================================================================

/// Builds the OCI-style runtime spec for a formula. The rootfs path is
/// bundle-relative; the process section carries the formula's exact
/// argv, env, cwd, and policy identity.
fn emit_runtime_spec(formula: &Formula) -> RuntimeSpec {
    let action = &formula.action;
    let (uid, gid) = action.policy.identity();
    let env: Vec<String> = action.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

    RuntimeSpec {
        oci_version: "1.0.2".to_string(),
        root: SpecRoot {
            path: ROOTFS_DIR.to_string(),
            readonly: false,
        },
        process: SpecProcess {
            terminal: false,
            user: SpecUser { uid, gid },
            args: action.entrypoint.clone(),
            env,
            cwd: action.cwd.clone(),
        },
        hostname: "reprorun".to_string(),
        mounts: vec![
            SpecMount {
                destination: "/proc".to_string(),
                mount_type: "proc".to_string(),
                source: "proc".to_string(),
                options: vec![],
            },
            SpecMount {
                destination: "/dev".to_string(),
                mount_type: "tmpfs".to_string(),
                source: "tmpfs".to_string(),
                options: vec!["nosuid".to_string(), "strictatime".to_string(), "mode=755".to_string()],
            },
        ],
        linux: SpecLinux {
            namespaces: ["pid", "network", "ipc", "uts", "mount"]
                .iter()
                .map(|ns| SpecNamespace {
                    ns_type: ns.to_string(),
                })
                .collect(),
        },
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RuntimeSpec {
    oci_version: String,
    root: SpecRoot,
    process: SpecProcess,
    hostname: String,
    mounts: Vec<SpecMount>,
    linux: SpecLinux,
}

#[derive(Debug, Serialize)]
struct SpecRoot {
    path: String,
    readonly: bool,
}

#[derive(Debug, Serialize)]
struct SpecProcess {
    terminal: bool,
    user: SpecUser,
    args: Vec<String>,
    env: Vec<String>,
    cwd: String,
}

#[derive(Debug, Serialize)]
struct SpecUser {
    uid: u32,
    gid: u32,
}

#[derive(Debug, Serialize)]
struct SpecMount {
    destination: String,
    #[serde(rename = "type")]
    mount_type: String,
    source: String,
    options: Vec<String>,
}

#[derive(Debug, Serialize)]
struct SpecLinux {
    namespaces: Vec<SpecNamespace>,
}

#[derive(Debug, Serialize)]
struct SpecNamespace {
    #[serde(rename = "type")]
    ns_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_carries_policy_identity_and_exact_env() {
        let mut formula = Formula::default();
        formula.action.entrypoint = vec!["/bin/sh".to_string(), "-c".to_string(), "true".to_string()];
        formula
            .action
            .env
            .insert("ONLY".to_string(), "this".to_string());
        formula.action.cwd = "/work".to_string();

        let spec = emit_runtime_spec(&formula);
        assert_eq!(spec.process.user.uid, 1000);
        assert_eq!(spec.process.args[0], "/bin/sh");
        assert_eq!(spec.process.env, vec!["ONLY=this"]);
        assert_eq!(spec.process.cwd, "/work");
        assert_eq!(spec.root.path, "rootfs");
    }
}
