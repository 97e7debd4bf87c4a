//! Per-call configuration for the dispatcher, plus pool-size resolution.

use slog::{o, Discard, Logger};
use std::net::IpAddr;
use std::time::Duration;

pub(crate) type StartHook<I> = Box<dyn Fn(&I, usize) + Send + Sync>;
pub(crate) type FinishHook<I, O> = Box<dyn Fn(&I, usize, Option<&O>) + Send + Sync>;

/// The hook contract for an external progress widget. The dispatcher calls
/// `begin` once with the total job count before handing out work, and `tick`
/// once per completed job. Only usable with a finite source.
pub trait Progress: Send + Sync {
    fn begin(&self, total: usize);
    fn tick(&self);
}

impl<T: Progress> Progress for std::sync::Arc<T> {
    fn begin(&self, total: usize) {
        (**self).begin(total);
    }
    fn tick(&self) {
        (**self).tick();
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum PoolKind {
    Threads,
    Processes,
}

pub(crate) struct Distribute {
    pub hosts: Vec<String>,
    pub timeout: Duration,
    pub command: Option<String>,
    pub local_address: Option<IpAddr>,
}

/// Knobs for a single `map`/`each` call, builder style.
pub struct Options<I, O> {
    pub(crate) kind: Option<PoolKind>,
    pub(crate) count: Option<usize>,
    pub(crate) max_rate: Option<u32>,
    pub(crate) preserve_results: bool,
    pub(crate) start: Option<StartHook<I>>,
    pub(crate) finish: Option<FinishHook<I, O>>,
    pub(crate) progress: Option<Box<dyn Progress>>,
    pub(crate) interrupt_signal: Option<i32>,
    pub(crate) sleep_after: bool,
    pub(crate) distribute: Option<Distribute>,
    pub(crate) log: Logger,
}

impl<I, O> Default for Options<I, O> {
    fn default() -> Self {
        Options {
            kind: None,
            count: None,
            max_rate: None,
            preserve_results: true,
            start: None,
            finish: None,
            progress: None,
            interrupt_signal: None,
            sleep_after: false,
            distribute: None,
            log: Logger::root(Discard, o!()),
        }
    }
}

impl<I, O> Options<I, O> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of workers, substrate left to the resolver.
    pub fn count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    /// Force the thread substrate with this many workers.
    pub fn in_threads(mut self, count: usize) -> Self {
        self.kind = Some(PoolKind::Threads);
        self.count = Some(count);
        self
    }

    /// Force the process substrate with this many workers.
    pub fn in_processes(mut self, count: usize) -> Self {
        self.kind = Some(PoolKind::Processes);
        self.count = Some(count);
        self
    }

    /// Global token bucket over the whole pool, in jobs per second.
    pub fn max_rate(mut self, jobs_per_second: u32) -> Self {
        self.max_rate = Some(jobs_per_second);
        self
    }

    /// When `false`, workers discard the callback's return value to avoid
    /// transporting it and `map` yields an empty vector.
    pub fn preserve_results(mut self, preserve: bool) -> Self {
        self.preserve_results = preserve;
        self
    }

    /// Called on the driver just before a job is dispatched.
    pub fn start(mut self, hook: impl Fn(&I, usize) + Send + Sync + 'static) -> Self {
        self.start = Some(Box::new(hook));
        self
    }

    /// Called on the driver after a job completes; the result is `None` on
    /// the failure path.
    pub fn finish(mut self, hook: impl Fn(&I, usize, Option<&O>) + Send + Sync + 'static) -> Self {
        self.finish = Some(Box::new(hook));
        self
    }

    pub fn progress(mut self, widget: impl Progress + 'static) -> Self {
        self.progress = Some(Box::new(widget));
        self
    }

    /// Signal trapped for kill-on-interrupt. Process-backed pools only;
    /// the thread substrate rejects this fast.
    pub fn interrupt_signal(mut self, signal: i32) -> Self {
        self.interrupt_signal = Some(signal);
        self
    }

    /// Skip pipe close + reap when a driver exits.
    pub fn sleep_after(mut self) -> Self {
        self.sleep_after = true;
        self
    }

    /// Spread the process pool across these hosts, reached by secure shell.
    /// Each host runs `count` workers that connect back to this process.
    pub fn distribute(mut self, hosts: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.distribute = Some(Distribute {
            hosts: hosts.into_iter().map(Into::into).collect(),
            timeout: Duration::from_secs(60),
            command: None,
            local_address: None,
        });
        self
    }

    /// How long to wait for remote workers to connect back.
    pub fn distribute_timeout(mut self, timeout: Duration) -> Self {
        if let Some(distribute) = &mut self.distribute {
            distribute.timeout = timeout;
        }
        self
    }

    /// Override of the command the remote side runs; defaults to the current
    /// executable.
    pub fn distribute_command(mut self, command: impl Into<String>) -> Self {
        if let Some(distribute) = &mut self.distribute {
            distribute.command = Some(command.into());
        }
        self
    }

    /// Override of the master's bind address; defaults to the first
    /// non-loopback IPv4 interface.
    pub fn local_address(mut self, address: IpAddr) -> Self {
        if let Some(distribute) = &mut self.distribute {
            distribute.local_address = Some(address);
        }
        self
    }

    pub fn log(mut self, log: Logger) -> Self {
        self.log = log;
        self
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Substrate {
    Direct,
    Threads(usize),
    Processes(usize),
}

/// Pool-size resolution. Threads are used exactly as requested; everything
/// else lands on the process substrate sized by the caller or the CPU count,
/// clamped to the source size when it is known. Size zero runs serially in
/// the caller.
pub(crate) fn resolve(
    kind: Option<PoolKind>,
    count: Option<usize>,
    source_size: Option<usize>,
    log: &Logger,
) -> Substrate {
    let kind = kind.unwrap_or(PoolKind::Processes);
    if kind == PoolKind::Processes && !cfg!(unix) {
        slog::warn!(log, "process pools need fork; running serially instead");
        return Substrate::Direct;
    }
    let requested = count.unwrap_or_else(num_cpus::get);
    let size = source_size.map_or(requested, |limit| requested.min(limit));
    match (kind, size) {
        (_, 0) => Substrate::Direct,
        (PoolKind::Threads, n) => Substrate::Threads(n),
        (PoolKind::Processes, n) => Substrate::Processes(n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log() -> Logger {
        Logger::root(Discard, o!())
    }

    #[test]
    fn threads_are_used_exactly_as_requested() {
        assert_eq!(
            resolve(Some(PoolKind::Threads), Some(7), Some(100), &log()),
            Substrate::Threads(7)
        );
    }

    #[test]
    fn default_substrate_is_processes() {
        assert_eq!(
            resolve(None, Some(3), Some(100), &log()),
            Substrate::Processes(3)
        );
    }

    #[test]
    fn unspecified_count_falls_back_to_the_cpu_count() {
        let resolved = resolve(None, None, None, &log());
        assert_eq!(resolved, Substrate::Processes(num_cpus::get()));
    }

    #[test]
    fn pool_is_clamped_to_the_source_size() {
        assert_eq!(
            resolve(Some(PoolKind::Threads), Some(8), Some(3), &log()),
            Substrate::Threads(3)
        );
        assert_eq!(resolve(None, Some(8), Some(3), &log()), Substrate::Processes(3));
    }

    #[test]
    fn unbounded_sources_do_not_clamp() {
        assert_eq!(
            resolve(Some(PoolKind::Threads), Some(8), None, &log()),
            Substrate::Threads(8)
        );
    }

    #[test]
    fn zero_workers_runs_serially() {
        assert_eq!(resolve(None, Some(0), Some(10), &log()), Substrate::Direct);
        assert_eq!(
            resolve(Some(PoolKind::Threads), Some(4), Some(0), &log()),
            Substrate::Direct
        );
    }
}
