//! The forked-process pool: N children on pipe pairs, one driver thread per
//! child, kill-on-interrupt over the whole group.

use crate::dispatch::{drive, Board, Hooks};
use crate::factory::JobFactory;
use crate::interrupt::KillOnInterrupt;
use crate::options::Options;
use crate::worker::{serve, PipeWorker};
use anyhow::Context as _;
use fanout_base::{DispatchError, DispatchResult, Fault, Result};
use nix::unistd::{fork, pipe, ForkResult};
use serde::{de::DeserializeOwned, Serialize};
use std::fs::File;
use std::mem;

pub(crate) fn run<I, O, F>(
    factory: &JobFactory<I>,
    options: &Options<I, O>,
    call: &F,
    count: usize,
) -> DispatchResult<Option<Vec<O>>>
where
    I: Clone + Send + Sync + Serialize + DeserializeOwned,
    O: Send + Serialize + DeserializeOwned,
    F: Fn(I, usize) -> std::result::Result<O, Fault> + Sync,
{
    let workers =
        spawn_workers(factory, options, call, count).map_err(DispatchError::System)?;
    let pids = workers.iter().map(|worker| worker.child()).collect::<Vec<_>>();
    let signal = options
        .interrupt_signal
        .unwrap_or(signal_hook::consts::SIGINT);
    let _guard = KillOnInterrupt::new(pids, signal).map_err(DispatchError::System)?;

    let board = Board::new(if options.preserve_results {
        factory.size()
    } else {
        None
    });
    let hooks = Hooks::new(options);
    drive(factory, &board, &hooks, options.sleep_after, workers);
    board.into_outcome(options.preserve_results)
}

/// Fork the children. Each child first drops the parent-side endpoints it
/// inherited (the siblings forked before it, then its own) so the only open
/// handles on any pipe are the two that matter.
fn spawn_workers<I, O, F>(
    factory: &JobFactory<I>,
    options: &Options<I, O>,
    call: &F,
    count: usize,
) -> Result<Vec<PipeWorker>>
where
    I: Clone + Serialize + DeserializeOwned,
    O: Serialize,
    F: Fn(I, usize) -> std::result::Result<O, Fault>,
{
    let mut workers: Vec<PipeWorker> = vec![];
    for _ in 0..count {
        let (job_read, job_write) = pipe().context("creating job pipe")?;
        let (result_read, result_write) = pipe().context("creating result pipe")?;
        match unsafe { fork() }.context("forking worker")? {
            ForkResult::Child => {
                drop(mem::take(&mut workers));
                drop(job_write);
                drop(result_read);
                let code = match serve(
                    File::from(job_read),
                    File::from(result_write),
                    factory,
                    options.preserve_results,
                    call,
                ) {
                    Ok(()) => 0,
                    Err(_) => 1,
                };
                unsafe { libc::_exit(code) }
            }
            ForkResult::Parent { child } => {
                drop(job_read);
                drop(result_write);
                slog::debug!(options.log, "forked worker"; "pid" => child.as_raw());
                workers.push(PipeWorker::new(
                    File::from(result_read),
                    File::from(job_write),
                    child,
                ));
            }
        }
    }
    Ok(workers)
}
