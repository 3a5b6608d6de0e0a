//! Preforking worker pool.
//!
//! The parent process binds every configured listener, then forks and
//! supervises a pool of worker processes. Each worker owns its own
//! current-thread tokio runtime, accepts one connection at a time from
//! the shared listeners (the kernel serializes `accept`), serves it,
//! and exits after `max_requests` connections so long-lived state
//! cannot accumulate.
//!
//! ```text
//! parent (no async runtime, ever)
//!   ├── bind listeners, status pipe, signal flags
//!   ├── fork ──► worker: tokio rt ──► accept → serve → accept → …
//!   ├── fork ──► worker
//!   └── tick loop: read worker status, prune the dead,
//!       spawn while idle < min_spare, retire while idle > max_spare
//! ```
//!
//! `fork()` MUST precede any tokio runtime in the forking process: a
//! runtime spawns threads, and fork duplicates only the calling
//! thread. The parent therefore stays fully synchronous (nix + poll);
//! only workers (each a fresh single-threaded process) build a
//! runtime.
//!
//! Worker status travels over one shared pipe as `<pid> <I|B|X>`
//! lines (idle, busy, exiting); each message is far below `PIPE_BUF`,
//! so writes are atomic. `SIGCHLD` is set to `SIG_IGN` in the parent,
//! so the kernel auto-reaps: dead workers are detected with
//! `kill(pid, 0)` rather than `waitpid`.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::os::fd::AsFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::Poll;
use std::time::{Duration, Instant};

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::{SigHandler, Signal, kill, signal};
use nix::unistd::{ForkResult, Pid, fork};

use crate::arc_log;
use crate::config::Config;
use crate::constants::POOL_TICK;
use crate::error::{Error, Result};
use crate::log::facility;
use crate::sasl::MemoryStore;
use crate::server::serve_connection;

// =============================================================================
// Planning
// =============================================================================

/// Pool sizing bounds, lifted from the `[arcd]` section.
#[derive(Debug, Clone, Copy)]
pub struct PoolBounds {
    pub min_servers: usize,
    pub max_servers: usize,
    pub min_spare: usize,
    pub max_spare: usize,
}

/// One supervision decision: how many workers to fork and how many
/// idle workers to retire this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolPlan {
    pub spawn: usize,
    pub retire: usize,
}

/// Computes the spawn/retire counts that restore the pool invariants:
/// `min_spare <= idle <= max_spare` (as far as `max_servers` and
/// `min_servers` allow) and `min_servers <= total <= max_servers`.
///
/// Pure arithmetic, separated from the fork machinery so the
/// invariants are testable without processes.
#[must_use]
pub fn plan(idle: usize, busy: usize, bounds: &PoolBounds) -> PoolPlan {
    let total = idle + busy;
    let want_spare = bounds.min_spare.saturating_sub(idle);
    let want_floor = bounds.min_servers.saturating_sub(total);
    let capacity = bounds.max_servers.saturating_sub(total);
    let spawn = want_spare.max(want_floor).min(capacity);

    let excess = idle.saturating_sub(bounds.max_spare);
    let above_floor = (total + spawn).saturating_sub(bounds.min_servers);
    let retire = excess.min(above_floor);

    PoolPlan { spawn, retire }
}

// =============================================================================
// Signal Flags
// =============================================================================

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_termination(_: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn install_parent_signals() -> Result<()> {
    // SAFETY: handler only touches an atomic flag; SIG_IGN on SIGCHLD
    // delegates reaping to the kernel.
    unsafe {
        signal(Signal::SIGCHLD, SigHandler::SigIgn)
            .map_err(|e| Error::Internal(format!("sigchld: {e}")))?;
        signal(Signal::SIGTERM, SigHandler::Handler(handle_termination))
            .map_err(|e| Error::Internal(format!("sigterm: {e}")))?;
        signal(Signal::SIGINT, SigHandler::Handler(handle_termination))
            .map_err(|e| Error::Internal(format!("sigint: {e}")))?;
    }
    Ok(())
}

// =============================================================================
// Parent
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Idle,
    Busy,
    /// Sent SIGTERM, waiting for it to go away. Counts toward the
    /// total, never as idle.
    Retiring,
}

/// The preforking pool supervisor.
pub struct PreforkPool {
    config: Arc<Config>,
    listeners: Vec<std::net::TcpListener>,
    status_rd: std::fs::File,
    status_wr: std::fs::File,
    workers: HashMap<Pid, WorkerState>,
}

impl PreforkPool {
    /// Binds every configured listener and prepares supervision state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Bind`] if any listen address is unavailable.
    pub fn bind(config: Arc<Config>) -> Result<Self> {
        let mut listeners = Vec::new();
        for port in &config.daemon.ports {
            let addr = format!("{}:{port}", config.daemon.host);
            let listener = std::net::TcpListener::bind(&addr)
                .map_err(|source| Error::Bind { addr: addr.clone(), source })?;
            arc_log!(config.log_level, facility::USER, "listening on {addr}");
            listeners.push(listener);
        }

        let (status_rd, status_wr) =
            nix::unistd::pipe().map_err(|e| Error::Internal(format!("status pipe: {e}")))?;
        Ok(Self {
            config,
            listeners,
            status_rd: std::fs::File::from(status_rd),
            status_wr: std::fs::File::from(status_wr),
            workers: HashMap::new(),
        })
    }

    /// The listen addresses actually bound (useful when a port was 0).
    #[must_use]
    pub fn local_addrs(&self) -> Vec<std::net::SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|l| l.local_addr().ok())
            .collect()
    }

    fn bounds(&self) -> PoolBounds {
        let d = &self.config.daemon;
        PoolBounds {
            min_servers: d.min_servers,
            max_servers: d.max_servers,
            min_spare: d.min_spare_servers,
            max_spare: d.max_spare_servers,
        }
    }

    /// Runs the supervision loop until a termination signal arrives.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if forking or signal setup fails
    /// outright; individual worker failures are absorbed and replaced.
    pub fn run(&mut self) -> Result<()> {
        install_parent_signals()?;

        while !SHUTDOWN.load(Ordering::SeqCst) {
            self.wait_for_status(POOL_TICK);
            self.drain_status();
            self.prune_dead();

            let idle = self.count(WorkerState::Idle);
            let busy = self.count(WorkerState::Busy) + self.count(WorkerState::Retiring);
            let plan = plan(idle, busy, &self.bounds());

            for _ in 0..plan.spawn {
                if let Err(err) = self.spawn_worker() {
                    arc_log!(self.config.log_level, facility::ERR, "fork failed: {err}");
                    break;
                }
            }
            if plan.retire > 0 {
                self.retire_idle(plan.retire);
            }
        }

        arc_log!(
            self.config.log_level,
            facility::USER,
            "shutting down pool ({} workers)",
            self.workers.len()
        );
        self.terminate_all();
        Ok(())
    }

    /// Blocks up to `tick` for status traffic.
    fn wait_for_status(&self, tick: Duration) {
        let mut fds = [PollFd::new(self.status_rd.as_fd(), PollFlags::POLLIN)];
        let timeout = PollTimeout::try_from(tick.as_millis().min(60_000) as u16)
            .unwrap_or(PollTimeout::MAX);
        let _ = poll(&mut fds, timeout);
    }

    /// Applies every pending worker status message.
    fn drain_status(&mut self) {
        let mut buf = [0u8; 4096];
        loop {
            let mut fds = [PollFd::new(self.status_rd.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::ZERO) {
                Ok(n) if n > 0 => {}
                _ => return,
            }
            let Ok(read) = (&self.status_rd).read(&mut buf) else {
                return;
            };
            if read == 0 {
                return;
            }
            for line in buf[..read].split(|&b| b == b'\n') {
                self.apply_status(line);
            }
        }
    }

    fn apply_status(&mut self, line: &[u8]) {
        let Ok(text) = std::str::from_utf8(line) else {
            return;
        };
        let Some((pid, state)) = text.trim().split_once(' ') else {
            return;
        };
        let Ok(pid) = pid.parse::<i32>() else {
            return;
        };
        let pid = Pid::from_raw(pid);
        match state {
            "I" => {
                // A retiring worker's late idle report must not
                // resurrect it into the spare count.
                if self.workers.get(&pid) != Some(&WorkerState::Retiring) {
                    self.workers.insert(pid, WorkerState::Idle);
                }
            }
            "B" => {
                if self.workers.get(&pid) != Some(&WorkerState::Retiring) {
                    self.workers.insert(pid, WorkerState::Busy);
                }
            }
            "X" => {
                self.workers.remove(&pid);
            }
            _ => {}
        }
    }

    /// Drops workers that no longer exist (kernel auto-reaped them).
    fn prune_dead(&mut self) {
        self.workers
            .retain(|pid, _| kill(*pid, None).is_ok());
    }

    fn count(&self, state: WorkerState) -> usize {
        self.workers.values().filter(|s| **s == state).count()
    }

    /// Forks one worker. The child never returns from this call.
    fn spawn_worker(&mut self) -> Result<()> {
        // SAFETY: the parent never constructs an async runtime, so at
        // this point the process is single-threaded and fork() is
        // well-defined. The child immediately enters worker_main and
        // exits the process when done.
        match unsafe { fork() }.map_err(|e| Error::Internal(format!("fork: {e}")))? {
            ForkResult::Parent { child } => {
                arc_log!(
                    self.config.log_level,
                    facility::DEBUG,
                    "worker {} forked",
                    child.as_raw()
                );
                self.workers.insert(child, WorkerState::Idle);
                Ok(())
            }
            ForkResult::Child => {
                let code = worker_main(&self.listeners, &self.status_wr, Arc::clone(&self.config));
                std::process::exit(code.into());
            }
        }
    }

    /// SIGTERMs up to `count` idle workers.
    fn retire_idle(&mut self, count: usize) {
        let victims: Vec<Pid> = self
            .workers
            .iter()
            .filter(|(_, state)| **state == WorkerState::Idle)
            .map(|(pid, _)| *pid)
            .take(count)
            .collect();
        for pid in victims {
            arc_log!(
                self.config.log_level,
                facility::DEBUG,
                "retiring worker {}",
                pid.as_raw()
            );
            let _ = kill(pid, Signal::SIGTERM);
            self.workers.insert(pid, WorkerState::Retiring);
        }
    }

    /// Graceful shutdown: SIGTERM everyone, wait a bounded moment.
    fn terminate_all(&mut self) {
        for pid in self.workers.keys() {
            let _ = kill(*pid, Signal::SIGTERM);
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while !self.workers.is_empty() && Instant::now() < deadline {
            self.wait_for_status(Duration::from_millis(100));
            self.drain_status();
            self.prune_dead();
        }
        for pid in self.workers.keys() {
            let _ = kill(*pid, Signal::SIGKILL);
        }
        self.workers.clear();
    }
}

// =============================================================================
// Worker
// =============================================================================

fn report(status: &std::fs::File, state: u8) {
    let line = format!("{} {}\n", std::process::id(), state as char);
    let _ = (&*status).write_all(line.as_bytes());
}

/// Worker entry point, running in the freshly forked child.
///
/// Builds its own current-thread runtime, converts the inherited
/// listeners, and serves up to `max_requests` connections.
fn worker_main(
    listeners: &[std::net::TcpListener],
    status: &std::fs::File,
    config: Arc<Config>,
) -> u8 {
    // The parent ignores SIGCHLD; this worker spawns commands and must
    // reap them itself, so restore the default disposition before the
    // runtime installs its own child-signal handling.
    // SAFETY: straight signal disposition reset in a single-threaded
    // child.
    unsafe {
        let _ = signal(Signal::SIGCHLD, SigHandler::SigDfl);
        let _ = signal(Signal::SIGTERM, SigHandler::SigDfl);
        let _ = signal(Signal::SIGINT, SigHandler::SigDfl);
    }

    let mask = config.log_level;
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(err) => {
            arc_log!(mask, facility::ERR, "worker runtime build failed: {err}");
            return 1;
        }
    };

    runtime.block_on(async {
        let mut accept_listeners = Vec::new();
        for listener in listeners {
            let cloned = match listener.try_clone().and_then(|l| {
                l.set_nonblocking(true)?;
                tokio::net::TcpListener::from_std(l)
            }) {
                Ok(l) => l,
                Err(err) => {
                    arc_log!(mask, facility::ERR, "listener conversion failed: {err}");
                    return 1;
                }
            };
            accept_listeners.push(cloned);
        }

        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(err) => {
                    arc_log!(mask, facility::ERR, "signal setup failed: {err}");
                    return 1;
                }
            };

        let store = Arc::new(MemoryStore::new(config.users.clone()));
        let budget = config.daemon.max_requests;
        let mut served = 0usize;

        while served < budget {
            report(status, b'I');
            tokio::select! {
                biased;
                _ = sigterm.recv() => break,
                accepted = accept_any(&accept_listeners) => {
                    let stream = match accepted {
                        Ok(stream) => stream,
                        Err(err) => {
                            arc_log!(mask, facility::ERR, "accept failed: {err}");
                            continue;
                        }
                    };
                    report(status, b'B');
                    served += 1;
                    if let Err(err) =
                        serve_connection(stream, Arc::clone(&config), store.clone()).await
                    {
                        arc_log!(mask, facility::DEBUG, "session ended with error: {err}");
                    }
                }
            }
        }

        report(status, b'X');
        0
    })
}

/// Resolves with the first connection available on any listener.
async fn accept_any(listeners: &[tokio::net::TcpListener]) -> std::io::Result<tokio::net::TcpStream> {
    std::future::poll_fn(|cx| {
        for listener in listeners {
            if let Poll::Ready(result) = listener.poll_accept(cx) {
                return Poll::Ready(result.map(|(stream, _)| stream));
            }
        }
        Poll::Pending
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOUNDS: PoolBounds = PoolBounds {
        min_servers: 2,
        max_servers: 8,
        min_spare: 2,
        max_spare: 4,
    };

    #[test]
    fn test_plan_tops_up_spares() {
        let p = plan(0, 0, &BOUNDS);
        assert_eq!(p, PoolPlan { spawn: 2, retire: 0 });

        let p = plan(1, 3, &BOUNDS);
        assert_eq!(p, PoolPlan { spawn: 1, retire: 0 });
    }

    #[test]
    fn test_plan_respects_max_servers() {
        let p = plan(0, 8, &BOUNDS);
        assert_eq!(p.spawn, 0);

        let p = plan(1, 6, &BOUNDS);
        assert_eq!(p.spawn, 1);
    }

    #[test]
    fn test_plan_retires_excess_spares() {
        let p = plan(6, 0, &BOUNDS);
        assert_eq!(p, PoolPlan { spawn: 0, retire: 2 });
    }

    #[test]
    fn test_plan_never_dips_below_min_servers() {
        let floor = PoolBounds {
            min_servers: 6,
            max_servers: 8,
            min_spare: 1,
            max_spare: 2,
        };
        // Six idle, max_spare 2: naive retirement of 4 would leave
        // only min_servers. Allowed, but never fewer.
        let p = plan(6, 0, &floor);
        assert_eq!(p.retire, 2.min(6 - floor.min_servers));
        assert!(6 - p.retire >= floor.min_servers);
    }

    #[test]
    fn test_plan_enforces_floor() {
        let p = plan(0, 1, &BOUNDS);
        assert!(p.spawn >= 1);

        // Quiescent pool sits inside the invariant band.
        let p = plan(3, 2, &BOUNDS);
        assert_eq!(p, PoolPlan { spawn: 0, retire: 0 });
    }
}
