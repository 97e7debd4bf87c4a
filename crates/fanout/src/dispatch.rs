//! Driver-side machinery shared by every substrate: the result board, the
//! fault slot, instrumentation, and the per-worker drive loop the
//! process-backed pools run.

use crate::options::Options;
use fanout_base::{DispatchError, DispatchResult, Fault, JobFault};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;

/// Why dispatch stopped early. Exactly one of these survives a failed run.
pub(crate) enum Halt {
    /// A job callback returned a verdict (Break, Kill, or an error).
    Fault(Fault),
    /// The dispatch machinery itself failed (a dead worker, usually).
    Dispatch(DispatchError),
}

impl From<Fault> for Halt {
    fn from(fault: Fault) -> Self {
        Halt::Fault(fault)
    }
}

impl From<DispatchError> for Halt {
    fn from(err: DispatchError) -> Self {
        Halt::Dispatch(err)
    }
}

/// The results vector and the halt slot, shared by every driver in a pool.
pub(crate) struct Board<O> {
    results: Mutex<Vec<Option<O>>>,
    halt: Mutex<Option<Halt>>,
}

impl<O> Board<O> {
    pub(crate) fn new(size_hint: Option<usize>) -> Self {
        let mut results = vec![];
        if let Some(hint) = size_hint {
            results.resize_with(hint, || None);
        }
        Board {
            results: Mutex::new(results),
            halt: Mutex::new(None),
        }
    }

    pub(crate) fn store(&self, index: usize, output: O) {
        let mut results = self.results.lock().unwrap();
        if index >= results.len() {
            results.resize_with(index + 1, || None);
        }
        results[index] = Some(output);
    }

    pub(crate) fn halted(&self) -> bool {
        self.halt.lock().unwrap().is_some()
    }

    /// Record why a driver stopped. A Kill verdict is never displaced, and a
    /// dispatch failure never displaces an earlier halt (workers dying while
    /// a pool tears down are a consequence, not the cause). Among callback
    /// verdicts, the last writer wins.
    pub(crate) fn record(&self, halt: Halt) {
        let mut slot = self.halt.lock().unwrap();
        match (&*slot, &halt) {
            (Some(Halt::Fault(Fault::Kill)), _) => {}
            (Some(_), Halt::Dispatch(_)) => {}
            _ => *slot = Some(halt),
        }
    }

    /// The one outcome of the run: the ordered results, `None` after a
    /// Break/Kill verdict, or the single surfaced error. On the success path
    /// every index was assigned, so the stored slots are all full.
    pub(crate) fn into_outcome(self, preserve_results: bool) -> DispatchResult<Option<Vec<O>>> {
        match self.halt.into_inner().unwrap() {
            None => {
                if !preserve_results {
                    return Ok(Some(vec![]));
                }
                let results = self.results.into_inner().unwrap();
                Ok(Some(results.into_iter().map(|slot| slot.unwrap()).collect()))
            }
            Some(Halt::Fault(Fault::Break)) | Some(Halt::Fault(Fault::Kill)) => Ok(None),
            Some(Halt::Fault(Fault::Error(err))) => Err(DispatchError::Job(err)),
            Some(Halt::Dispatch(err)) => Err(err),
        }
    }
}

/// The start/finish hooks and the progress widget, serialized by one mutex
/// so user hooks never run concurrently with each other.
pub(crate) struct Hooks<'a, I, O> {
    options: &'a Options<I, O>,
    lock: Mutex<()>,
}

impl<'a, I, O> Hooks<'a, I, O> {
    pub(crate) fn new(options: &'a Options<I, O>) -> Self {
        Hooks {
            options,
            lock: Mutex::new(()),
        }
    }

    pub(crate) fn before(&self, item: &I, index: usize) {
        if let Some(hook) = &self.options.start {
            let _serial = self.lock.lock().unwrap();
            hook(item, index);
        }
    }

    /// `result` is `None` on the failure path and when results are discarded.
    pub(crate) fn after(&self, item: &I, index: usize, result: Option<&O>) {
        if self.options.finish.is_none() && self.options.progress.is_none() {
            return;
        }
        let _serial = self.lock.lock().unwrap();
        if let Some(hook) = &self.options.finish {
            hook(item, index, result);
        }
        if let Some(progress) = &self.options.progress {
            progress.tick();
        }
    }
}

/// Run the callback, turning a panic into an ordinary fault so it can cross
/// back to the master like any other failure.
pub(crate) fn invoke<I, O, F>(call: &F, item: I, index: usize) -> Result<O, Fault>
where
    F: Fn(I, usize) -> Result<O, Fault>,
{
    match panic::catch_unwind(AssertUnwindSafe(|| call(item, index))) {
        Ok(result) => result,
        Err(payload) => Err(Fault::Error(JobFault::from_panic(&*payload).into_error())),
    }
}

#[cfg(unix)]
pub(crate) use unix::drive;

#[cfg(unix)]
mod unix {
    use super::*;
    use crate::factory::JobFactory;
    use crate::worker::{WorkReply, WorkerLink};
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    use std::thread;

    /// The §4.7 drive loop, shared by the process pool and the distributed
    /// master: one driver thread per worker, each pulling from the factory
    /// and blocking on its own worker's reply. Reply arrival is the
    /// backpressure signal, so the factory is drained at exactly the
    /// aggregate worker throughput.
    pub(crate) fn drive<I, O, W>(
        factory: &JobFactory<I>,
        board: &Board<O>,
        hooks: &Hooks<'_, I, O>,
        sleep_after: bool,
        workers: Vec<W>,
    ) where
        I: Clone + Send + Sync,
        O: Send,
        W: WorkerLink<I, O>,
    {
        let pids: Vec<Option<Pid>> = workers.iter().map(|worker| worker.pid()).collect();
        thread::scope(|scope| {
            for (me, mut worker) in workers.into_iter().enumerate() {
                let pids = &pids;
                scope.spawn(move || {
                    loop {
                        if board.halted() {
                            break;
                        }
                        let Some((item, index)) = factory.next() else {
                            break;
                        };
                        hooks.before(&item, index);
                        match worker.work(factory.pack(item.clone(), index)) {
                            Ok(WorkReply::Output(output)) => {
                                hooks.after(&item, index, Some(&output));
                                board.store(index, output);
                            }
                            Ok(WorkReply::Discarded) => {
                                hooks.after(&item, index, None);
                            }
                            Ok(WorkReply::Fault(fault)) => {
                                hooks.after(&item, index, None);
                                let is_kill = matches!(fault, Fault::Kill);
                                board.record(fault.into());
                                if is_kill {
                                    kill_others(pids, me);
                                }
                                break;
                            }
                            Err(err) => {
                                hooks.after(&item, index, None);
                                board.record(err.into());
                                break;
                            }
                        }
                    }
                    if !sleep_after {
                        worker.close();
                        worker.wait();
                    } else {
                        // Leak the endpoints so the worker lingers past this
                        // call instead of seeing EOF now.
                        std::mem::forget(worker);
                    }
                });
            }
        });
    }

    /// The Kill sweep: every other worker with a pid is taken down hard,
    /// before its driver gets a chance to hand it more work.
    fn kill_others(pids: &[Option<Pid>], me: usize) {
        for (other, pid) in pids.iter().enumerate() {
            if other != me {
                if let Some(pid) = pid {
                    kill(*pid, Signal::SIGKILL).ok();
                }
            }
        }
    }
}
