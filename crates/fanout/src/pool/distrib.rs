//! Distributed dispatch. The master starts the same program on remote hosts
//! over secure shell; each host's slave forks workers that connect back over
//! TCP, and the master then runs the ordinary drive loop over those sockets.

use crate::dispatch::{drive, Board, Hooks};
use crate::factory::JobFactory;
use crate::interrupt::KillOnInterrupt;
use crate::options::{Distribute, Options};
use crate::worker::{serve, SocketWorker};
use anyhow::{anyhow, bail, Context as _};
use fanout_base::{DispatchError, DispatchResult, Fault, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{fork, ForkResult, Pid};
use serde::{de::DeserializeOwned, Serialize};
use std::io::{BufReader, ErrorKind};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs as _};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Pause between ssh spawns so a burst of hosts does not overwhelm the shell
/// service.
const SPAWN_STAGGER: Duration = Duration::from_millis(200);
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/*              _     _ _
 *  _ __  _   _| |__ | (_) ___
 * | '_ \| | | | '_ \| | |/ __|
 * | |_) | |_| | |_) | | | (__
 * | .__/ \__,_|_.__/|_|_|\___|
 * |_|
 *  FIGLET: public
 */

/// The master never runs the callback itself; the remote slaves hold their
/// own copy of the program and with it the callback.
pub(crate) fn run_master<I, O>(
    factory: &JobFactory<I>,
    options: &Options<I, O>,
    count: usize,
) -> DispatchResult<Option<Vec<O>>>
where
    I: Clone + Send + Sync + Serialize + DeserializeOwned,
    O: Send + Serialize + DeserializeOwned,
{
    let distribute = options.distribute.as_ref().unwrap();
    let (listener, address, port) =
        bind_listener(distribute).map_err(DispatchError::System)?;
    let mut shells =
        start_remote_hosts(distribute, options, address, port).map_err(DispatchError::System)?;

    let expected = distribute.hosts.len() * count;
    let streams = match accept_back(&listener, expected, distribute.timeout) {
        Ok(streams) => streams,
        Err(err) => {
            // Give up on every shell child before surfacing the timeout.
            quit_shells(&mut shells);
            return Err(err);
        }
    };
    slog::debug!(options.log, "remote workers connected"; "count" => streams.len());

    let workers = streams
        .into_iter()
        .map(SocketWorker::new)
        .collect::<Result<Vec<_>>>()
        .map_err(DispatchError::System)?;

    let signal = options
        .interrupt_signal
        .unwrap_or(signal_hook::consts::SIGINT);
    let shell_pids = shells
        .iter()
        .map(|shell| Pid::from_raw(shell.id() as i32))
        .collect::<Vec<_>>();
    let _guard = KillOnInterrupt::new(shell_pids, signal).map_err(DispatchError::System)?;

    let board = Board::new(if options.preserve_results {
        factory.size()
    } else {
        None
    });
    let hooks = Hooks::new(options);
    drive::<I, O, SocketWorker>(factory, &board, &hooks, options.sleep_after, workers);

    if !options.sleep_after {
        for shell in &mut shells {
            shell.wait().ok();
        }
    }
    board.into_outcome(options.preserve_results)
}

/// The slave side, entered when `MASTER` is set in the environment: fork
/// `count` workers that connect back and serve jobs, reap them, and exit.
/// Never returns.
pub(crate) fn run_slave<I, O, F>(
    master: &str,
    factory: &JobFactory<I>,
    options: &Options<I, O>,
    call: &F,
    count: usize,
) -> !
where
    I: Clone + Serialize + DeserializeOwned,
    O: Serialize,
    F: Fn(I, usize) -> std::result::Result<O, Fault>,
{
    let address = match parse_master(master) {
        Ok(address) => address,
        Err(err) => {
            eprintln!("bad MASTER value {master:?}: {err:#}");
            std::process::exit(1);
        }
    };
    let mut children = vec![];
    for _ in 0..count {
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                let code = match connect_and_serve(address, factory, options, call) {
                    Ok(()) => 0,
                    Err(_) => 1,
                };
                unsafe { libc::_exit(code) }
            }
            Ok(ForkResult::Parent { child }) => children.push(child),
            Err(err) => {
                eprintln!("forking remote worker: {err}");
                std::process::exit(1);
            }
        }
    }
    for child in children {
        loop {
            match waitpid(child, None) {
                Err(Errno::EINTR) => continue,
                _ => break,
            }
        }
    }
    std::process::exit(0)
}

/*             _            _
 *  _ __  _ __(_)_   ____ _| |_ ___
 * | '_ \| '__| \ \ / / _` | __/ _ \
 * | |_) | |  | |\ V / (_| | ||  __/
 * | .__/|_|  |_| \_/ \__,_|\__\___|
 * |_|
 *  FIGLET: private
 */

fn bind_listener(distribute: &Distribute) -> Result<(TcpListener, IpAddr, u16)> {
    let address = match distribute.local_address {
        Some(address) => address,
        None => local_ipv4()?,
    };
    let listener =
        TcpListener::bind((address, 0)).context("binding the connect-back listener")?;
    let port = listener.local_addr()?.port();
    Ok((listener, address, port))
}

fn start_remote_hosts<I, O>(
    distribute: &Distribute,
    options: &Options<I, O>,
    address: IpAddr,
    port: u16,
) -> Result<Vec<Child>> {
    let command = match &distribute.command {
        Some(command) => command.clone(),
        None => std::env::current_exe()
            .context("finding the program to run remotely")?
            .display()
            .to_string(),
    };
    let mut shells = vec![];
    for host in &distribute.hosts {
        slog::debug!(options.log, "starting remote workers"; "host" => host.as_str());
        let shell = Command::new("ssh")
            .arg(host)
            .arg(format!("env 'MASTER={address}|{port}' 'MY_NODE={host}' {command}"))
            .stdin(Stdio::null())
            .spawn()
            .with_context(|| format!("spawning ssh to {host}"))?;
        shells.push(shell);
        thread::sleep(SPAWN_STAGGER);
    }
    Ok(shells)
}

/// Accept connect-backs until `expected` sockets are up or the deadline
/// passes.
fn accept_back(
    listener: &TcpListener,
    expected: usize,
    timeout: Duration,
) -> DispatchResult<Vec<TcpStream>> {
    listener
        .set_nonblocking(true)
        .map_err(|err| DispatchError::System(err.into()))?;
    let deadline = Instant::now() + timeout;
    let mut streams = vec![];
    while streams.len() < expected {
        match listener.accept() {
            Ok((stream, _)) => {
                stream
                    .set_nonblocking(false)
                    .map_err(|err| DispatchError::System(err.into()))?;
                streams.push(stream);
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(DispatchError::RemoteWorkerTimeout);
                }
                thread::sleep(ACCEPT_POLL);
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(DispatchError::System(err.into())),
        }
    }
    Ok(streams)
}

/// Quit signal to every ssh child, then reap them.
fn quit_shells(shells: &mut [Child]) {
    for shell in shells.iter() {
        kill(Pid::from_raw(shell.id() as i32), Signal::SIGTERM).ok();
    }
    for shell in shells {
        shell.wait().ok();
    }
}

fn connect_and_serve<I, O, F>(
    address: SocketAddr,
    factory: &JobFactory<I>,
    options: &Options<I, O>,
    call: &F,
) -> Result<()>
where
    I: Clone + Serialize + DeserializeOwned,
    O: Serialize,
    F: Fn(I, usize) -> std::result::Result<O, Fault>,
{
    let stream = TcpStream::connect(address).context("connecting back to the master")?;
    serve(
        BufReader::new(stream.try_clone()?),
        stream,
        factory,
        options.preserve_results,
        call,
    )
}

fn parse_master(value: &str) -> Result<SocketAddr> {
    let (host, port) = value
        .split_once('|')
        .ok_or_else(|| anyhow!("expected <host>|<port>"))?;
    let port: u16 = port.parse().context("parsing the master port")?;
    (host, port)
        .to_socket_addrs()
        .context("resolving the master address")?
        .next()
        .ok_or_else(|| anyhow!("the master address resolved to nothing"))
}

/// The first non-loopback IPv4 interface address.
fn local_ipv4() -> Result<IpAddr> {
    for interface in nix::ifaddrs::getifaddrs().context("listing interfaces")? {
        let Some(address) = interface.address else {
            continue;
        };
        let Some(inet) = address.as_sockaddr_in() else {
            continue;
        };
        let ip = Ipv4Addr::from(inet.ip());
        if !ip.is_loopback() {
            return Ok(IpAddr::V4(ip));
        }
    }
    bail!("no non-loopback IPv4 interface found")
}

/*  _            _
 * | |_ ___  ___| |_ ___
 * | __/ _ \/ __| __/ __|
 * | ||  __/\__ \ |_\__ \
 *  \__\___||___/\__|___/
 *  FIGLET: tests
 */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_master_splits_host_and_port() {
        let address = parse_master("127.0.0.1|4555").unwrap();
        assert_eq!(address, "127.0.0.1:4555".parse().unwrap());
        assert!(parse_master("127.0.0.1").is_err());
        assert!(parse_master("127.0.0.1|notaport").is_err());
    }

    #[test]
    fn accept_back_collects_the_expected_connect_backs() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        let connectors = thread::spawn(move || {
            let mut streams = vec![];
            for _ in 0..3 {
                streams.push(TcpStream::connect(address).unwrap());
            }
            streams
        });
        let streams = accept_back(&listener, 3, Duration::from_secs(10)).unwrap();
        assert_eq!(streams.len(), 3);
        connectors.join().unwrap();
    }

    #[test]
    fn accept_back_times_out_without_connect_backs() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let started = Instant::now();
        let result = accept_back(&listener, 1, Duration::from_millis(200));
        assert!(matches!(result, Err(DispatchError::RemoteWorkerTimeout)));
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[test]
    fn local_ipv4_never_picks_loopback() {
        // Containers may expose only loopback; all that is checkable
        // everywhere is that a found address is not loopback.
        if let Ok(IpAddr::V4(ip)) = local_ipv4() {
            assert!(!ip.is_loopback());
        }
    }
}
