//! Parallel map over a pool of independent workers: in-process threads,
//! forked child processes talking over pipes, or processes on remote hosts
//! reached by secure shell that connect back over TCP.
//!
//! Results always come back in source order, whatever order jobs complete
//! in, and a failed run surfaces exactly one error. A callback can return
//! [`Fault::Break`] to stop dispatch cooperatively or [`Fault::Kill`] to
//! stop it hard; both make `map` yield `None` instead of results.
//!
//! ```
//! use fanout::{Fault, Options};
//!
//! let squares = fanout::map(vec![1, 2, 3, 4], Options::new().in_threads(2), |x| {
//!     Ok::<_, Fault>(x * x)
//! })
//! .unwrap()
//! .unwrap();
//! assert_eq!(squares, vec![1, 4, 9, 16]);
//! ```

mod dispatch;
mod factory;
#[cfg(unix)]
mod interrupt;
mod options;
mod pool;
#[cfg(unix)]
mod worker;

pub use factory::{Produced, Source};
pub use fanout_base::{DispatchError, DispatchResult, Fault};
pub use options::{Options, Progress};

use anyhow::anyhow;
use factory::JobFactory;
use options::{resolve, PoolKind, Substrate};
use serde::{de::DeserializeOwned, Serialize};

/// Apply `call` to every item of `source` in parallel. `Ok(Some(results))`
/// holds one result per item in source order; `Ok(None)` means a callback
/// stopped the run with Break or Kill.
pub fn map<I, O, F>(
    source: impl Into<Source<I>>,
    options: Options<I, O>,
    call: F,
) -> DispatchResult<Option<Vec<O>>>
where
    I: Clone + Send + Sync + Serialize + DeserializeOwned,
    O: Send + Serialize + DeserializeOwned,
    F: Fn(I) -> Result<O, Fault> + Sync,
{
    run(source.into(), options, move |item, _| call(item)).0
}

/// [`map`] with the callback also receiving the item's dense index.
pub fn map_with_index<I, O, F>(
    source: impl Into<Source<I>>,
    options: Options<I, O>,
    call: F,
) -> DispatchResult<Option<Vec<O>>>
where
    I: Clone + Send + Sync + Serialize + DeserializeOwned,
    O: Send + Serialize + DeserializeOwned,
    F: Fn(I, usize) -> Result<O, Fault> + Sync,
{
    run(source.into(), options, call).0
}

/// [`map`] with results discarded at the workers; yields the source back
/// instead (array items intact).
pub fn each<I, O, F>(
    source: impl Into<Source<I>>,
    options: Options<I, O>,
    call: F,
) -> DispatchResult<Option<Source<I>>>
where
    I: Clone + Send + Sync + Serialize + DeserializeOwned,
    O: Send + Serialize + DeserializeOwned,
    F: Fn(I) -> Result<O, Fault> + Sync,
{
    let (outcome, source) = run(
        source.into(),
        options.preserve_results(false),
        move |item, _| call(item),
    );
    match outcome {
        Ok(Some(_)) => Ok(Some(source)),
        Ok(None) => Ok(None),
        Err(err) => Err(err),
    }
}

/// [`each`] with the callback also receiving the item's dense index.
pub fn each_with_index<I, O, F>(
    source: impl Into<Source<I>>,
    options: Options<I, O>,
    call: F,
) -> DispatchResult<Option<Source<I>>>
where
    I: Clone + Send + Sync + Serialize + DeserializeOwned,
    O: Send + Serialize + DeserializeOwned,
    F: Fn(I, usize) -> Result<O, Fault> + Sync,
{
    let (outcome, source) = run(source.into(), options.preserve_results(false), call);
    match outcome {
        Ok(Some(_)) => Ok(Some(source)),
        Ok(None) => Ok(None),
        Err(err) => Err(err),
    }
}

/// Launch `count` threads, hand each its own index, and collect the return
/// values in index order. A panicking thread propagates its panic here.
pub fn in_threads<O, F>(count: usize, call: F) -> Vec<O>
where
    O: Send,
    F: Fn(usize) -> O + Sync,
{
    std::thread::scope(|scope| {
        let call = &call;
        let handles: Vec<_> = (0..count)
            .map(|index| scope.spawn(move || call(index)))
            .collect();
        handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(value) => value,
                Err(payload) => std::panic::resume_unwind(payload),
            })
            .collect()
    })
}

/// Run `call(0), call(1), …, call(count - 1)` on the process substrate;
/// shorthand for a [`map`] over the index range.
pub fn in_processes<O, F>(count: Option<usize>, call: F) -> DispatchResult<Option<Vec<O>>>
where
    O: Send + Serialize + DeserializeOwned,
    F: Fn(usize) -> Result<O, Fault> + Sync,
{
    let count = count.unwrap_or_else(num_cpus::get);
    map_with_index(
        (0..count).collect::<Vec<_>>(),
        Options::new().in_processes(count),
        move |_, index| call(index),
    )
}

fn run<I, O, F>(
    source: Source<I>,
    options: Options<I, O>,
    call: F,
) -> (DispatchResult<Option<Vec<O>>>, Source<I>)
where
    I: Clone + Send + Sync + Serialize + DeserializeOwned,
    O: Send + Serialize + DeserializeOwned,
    F: Fn(I, usize) -> Result<O, Fault> + Sync,
{
    let factory = JobFactory::new(source, options.max_rate);

    // A program relaunched on a remote host comes up with MASTER set; it
    // connects back and serves jobs instead of dispatching its own.
    #[cfg(unix)]
    if let Ok(master) = std::env::var("MASTER") {
        let count = match resolve(options.kind, options.count, factory.size(), &options.log) {
            Substrate::Threads(count) | Substrate::Processes(count) => count,
            Substrate::Direct => 0,
        };
        pool::distrib::run_slave(&master, &factory, &options, &call, count);
    }

    if options.interrupt_signal.is_some() && options.kind == Some(PoolKind::Threads) {
        return (
            Err(DispatchError::System(anyhow!(
                "interrupt_signal is only supported by process pools"
            ))),
            factory.into_source(),
        );
    }
    if let Some(distribute) = &options.distribute {
        if distribute.hosts.is_empty() {
            return (
                Err(DispatchError::System(anyhow!(
                    "distribute needs at least one host"
                ))),
                factory.into_source(),
            );
        }
    }
    if let Some(progress) = &options.progress {
        match factory.size() {
            Some(total) => progress.begin(total),
            None => {
                return (
                    Err(DispatchError::System(anyhow!(
                        "a progress widget needs a finite source"
                    ))),
                    factory.into_source(),
                );
            }
        }
    }

    let substrate = resolve(options.kind, options.count, factory.size(), &options.log);
    slog::debug!(options.log, "dispatching"; "substrate" => ?substrate);
    let outcome = match substrate {
        Substrate::Direct => pool::direct::run(&factory, &options, &call),
        Substrate::Threads(count) => pool::threads::run(&factory, &options, &call, count),
        Substrate::Processes(count) => run_processes(&factory, &options, &call, count),
    };
    (outcome, factory.into_source())
}

#[cfg(unix)]
fn run_processes<I, O, F>(
    factory: &JobFactory<I>,
    options: &Options<I, O>,
    call: &F,
    count: usize,
) -> DispatchResult<Option<Vec<O>>>
where
    I: Clone + Send + Sync + Serialize + DeserializeOwned,
    O: Send + Serialize + DeserializeOwned,
    F: Fn(I, usize) -> Result<O, Fault> + Sync,
{
    if options.distribute.is_some() {
        pool::distrib::run_master(factory, options, count)
    } else {
        pool::process::run(factory, options, call, count)
    }
}

#[cfg(not(unix))]
fn run_processes<I, O, F>(
    _factory: &JobFactory<I>,
    _options: &Options<I, O>,
    _call: &F,
    _count: usize,
) -> DispatchResult<Option<Vec<O>>> {
    unreachable!("resolution never picks processes without fork")
}
