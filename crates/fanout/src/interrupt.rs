//! Kill-on-interrupt. Process-backed pools register their children here so a
//! user interrupt tears every pool down, innermost first, before the process
//! itself terminates.

use fanout_base::Result;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use signal_hook::iterator::backend::Handle;
use signal_hook::iterator::Signals;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread;

static GROUPS: Mutex<Vec<(u64, Vec<i32>)>> = Mutex::new(Vec::new());
static WATCHER: Mutex<Option<Watcher>> = Mutex::new(None);
static NEXT_GROUP: AtomicU64 = AtomicU64::new(0);

struct Watcher {
    handle: Handle,
    thread: Option<thread::JoinHandle<()>>,
}

/// Scoped registration of one pool's worker pids. The first live guard
/// installs the trap; dropping the last one tears it down. While the trap is
/// installed, delivery of the trapped signal hard-kills every registered pid,
/// most recently registered group first, and then lets the signal's default
/// disposition run so the process still terminates.
pub(crate) struct KillOnInterrupt {
    group: u64,
}

impl KillOnInterrupt {
    pub(crate) fn new(pids: impl IntoIterator<Item = Pid>, signal: i32) -> Result<Self> {
        let group = NEXT_GROUP.fetch_add(1, Ordering::Relaxed);
        let mut groups = GROUPS.lock().unwrap();
        if groups.is_empty() {
            install(signal)?;
        }
        groups.push((group, pids.into_iter().map(Pid::as_raw).collect()));
        Ok(KillOnInterrupt { group })
    }
}

impl Drop for KillOnInterrupt {
    fn drop(&mut self) {
        // Guards are usually dropped in stack order, but sibling pools on
        // different threads may interleave; remove this guard's own group.
        // The watcher thread takes the group lock during its kill sweep, so
        // it must be released before joining the watcher.
        let emptied = {
            let mut groups = GROUPS.lock().unwrap();
            groups.retain(|(group, _)| *group != self.group);
            groups.is_empty()
        };
        if emptied {
            uninstall();
        }
    }
}

fn install(signal: i32) -> Result<()> {
    let mut signals = Signals::new([signal])?;
    let handle = signals.handle();
    let thread = thread::spawn(move || {
        for signal in signals.forever() {
            eprintln!("interrupted; killing dispatched workers");
            kill_all_groups();
            let _ = signal_hook::low_level::emulate_default_handler(signal);
        }
    });
    *WATCHER.lock().unwrap() = Some(Watcher {
        handle,
        thread: Some(thread),
    });
    Ok(())
}

fn uninstall() {
    if let Some(mut watcher) = WATCHER.lock().unwrap().take() {
        watcher.handle.close();
        if let Some(thread) = watcher.thread.take() {
            thread.join().ok();
        }
    }
}

fn kill_all_groups() {
    let groups = GROUPS.lock().unwrap();
    for (_, group) in groups.iter().rev() {
        for &pid in group {
            // The pid may already be gone; that is fine.
            kill(Pid::from_raw(pid), Signal::SIGKILL).ok();
        }
    }
}
