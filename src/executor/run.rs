//! The run driver: one formula, one executor, one finished run record.

use super::{Executor, Job};
use crate::error::Result;
use crate::formula::Formula;
use crate::hashing;
use crate::runrecord::RunRecord;
use crate::streamer;
use std::io::Write;
use tracing::{error, info};

/// What one driven run produced: the sealed record, plus the action's
/// exit code for callers that surface it (the record itself only tracks
/// engine-level failure).
#[derive(Debug)]
pub struct RunOutcome {
    pub record: RunRecord,
    pub exit_code: i32,
}

/// Sinks for live job output. Stdout and stderr records are copied as
/// they appear in the spool.
pub type StreamSinks = (Box<dyn Write + Send>, Box<dyn Write + Send>);

/// Runs a formula to completion and seals the run record.
///
/// Engine failures land in the record's failure envelope rather than
/// this function's error; `Err` here means the job could not even be
/// started.
pub async fn run_formula(
    executor: &dyn Executor,
    formula: Formula,
    streams: Option<StreamSinks>,
) -> Result<RunOutcome> {
    let mut record = RunRecord::new();
    record.formula_hid = hashing::formula_hid(&formula)?;

    // Conjecture membership must survive the move of the formula into
    // the executor.
    let conjecture_outputs: Vec<String> = formula
        .outputs
        .iter()
        .filter(|(_, output)| output.conjecture)
        .map(|(name, _)| name.clone())
        .collect();

    let job_id = record.uid.clone();
    let job: Job = executor.start(formula, job_id, None).await?;

    let follower = streams.map(|(mut out, mut err)| {
        let spool = job.streams_path().to_path_buf();
        std::thread::spawn(move || {
            let _ = streamer::follow(&spool, &mut out, &mut err);
        })
    });

    let result = job.wait().await;
    if let Some(follower) = follower {
        let _ = follower.join();
    }

    match result.error {
        Some(failure) => {
            error!(job = %result.id, %failure, "job execution errored");
            record.failure = Some(failure);
        }
        None => {
            info!(job = %result.id, exit_code = result.exit_code, "job finished");
            for name in conjecture_outputs {
                if let Some(ware) = result.outputs.get(&name) {
                    record.results.insert(name, ware.clone());
                }
            }
        }
    }
    record.seal()?;
    Ok(RunOutcome {
        record,
        exit_code: result.exit_code,
    })
}
