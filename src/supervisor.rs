//! Worker supervision.
//!
//! The supervisor process serves no traffic. It launches `workers` copies of
//! its own binary in worker mode, each binding the shared listen address, and
//! relaunches any that exit. Nothing is shared between workers: each has its
//! own cache and its own upstream pool.
//!
//! | Event | Supervisor action |
//! |---|---|
//! | worker exits (crash or clean) | log, wait `respawn_delay`, relaunch into the same slot |
//! | relaunch fails | log, try again after `respawn_delay` |
//! | wait task fails (panic) | log, relaunch into the same slot; the dropped `Child` has been killed |
//! | SIGTERM / Ctrl-C | stop relaunching, SIGTERM every worker, wait `shutdown_grace`, kill the rest |

use std::collections::HashMap;
use std::ffi::OsString;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::error::Error;

/// Environment variable carrying a worker's slot number, for its logs.
pub const WORKER_ID_ENV: &str = "PORTICO_WORKER_ID";

/// Starts one worker process.
pub trait Launcher {
    fn launch(&self, slot: usize) -> io::Result<Child>;
}

/// Re-executes the running binary with the same arguments plus `--worker`.
pub struct ExecLauncher {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ExecLauncher {
    pub fn current() -> Result<Self, Error> {
        let program = std::env::current_exe()?;
        let args = std::env::args_os()
            .skip(1)
            .filter(|arg| arg.as_os_str() != "--worker")
            .collect();
        Ok(Self { program, args })
    }
}

impl Launcher for ExecLauncher {
    fn launch(&self, slot: usize) -> io::Result<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .arg("--worker")
            .env(WORKER_ID_ENV, slot.to_string())
            .kill_on_drop(true)
            .spawn()
    }
}

/// Which slot each supervisor task works for, keyed by task id so a task
/// that failed to join still gives its slot back.
type Slots = HashMap<Id, usize>;

pub struct Supervisor<L> {
    launcher: L,
    workers: usize,
    respawn_delay: Duration,
    shutdown_grace: Duration,
}

impl<L: Launcher> Supervisor<L> {
    pub fn new(launcher: L, workers: usize) -> Self {
        Self {
            launcher,
            workers,
            respawn_delay: Duration::from_millis(100),
            shutdown_grace: Duration::from_secs(30),
        }
    }

    pub fn with_respawn_delay(mut self, delay: Duration) -> Self {
        self.respawn_delay = delay;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Keeps `workers` processes running until `shutdown` resolves, then
    /// stops them. Fails only if a worker cannot be launched at startup.
    pub async fn run<F>(self, shutdown: F) -> Result<(), Error>
    where
        F: Future<Output = ()>,
    {
        let mut running: JoinSet<io::Result<ExitStatus>> = JoinSet::new();
        let mut running_slots = Slots::new();
        let mut respawns: JoinSet<()> = JoinSet::new();
        let mut respawn_slots = Slots::new();
        let mut pids: HashMap<usize, u32> = HashMap::new();

        for slot in 0..self.workers {
            self.start(slot, &mut running, &mut running_slots, &mut pids)?;
        }
        info!(workers = self.workers, "supervisor started");

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;

                () = &mut shutdown => {
                    info!(running = running.len(), "shutdown signal received, stopping workers");
                    break;
                }

                Some(joined) = running.join_next_with_id(), if !running.is_empty() => {
                    let Some(slot) = exited(&mut running_slots, joined) else { continue };
                    pids.remove(&slot);
                    self.schedule(slot, &mut respawns, &mut respawn_slots);
                }

                Some(joined) = respawns.join_next_with_id(), if !respawns.is_empty() => {
                    let Some(slot) = slot_of(&mut respawn_slots, &joined) else { continue };
                    if let Err(e) = self.start(slot, &mut running, &mut running_slots, &mut pids) {
                        error!(slot, error = %e, "could not relaunch worker");
                        self.schedule(slot, &mut respawns, &mut respawn_slots);
                    }
                }
            }
        }

        respawns.shutdown().await;
        for (&slot, &pid) in &pids {
            debug!(slot, pid, "sending SIGTERM");
            terminate(pid);
        }

        let grace = self.shutdown_grace;
        let stopped = timeout(grace, async { while running.join_next().await.is_some() {} }).await;
        if stopped.is_err() {
            warn!(remaining = running.len(), grace_secs = grace.as_secs(), "workers did not stop in time, killing");
            // Aborting a wait task drops its `Child`, which kills the process.
            running.shutdown().await;
        }

        info!("supervisor stopped");
        Ok(())
    }

    fn start(
        &self,
        slot: usize,
        running: &mut JoinSet<io::Result<ExitStatus>>,
        slots: &mut Slots,
        pids: &mut HashMap<usize, u32>,
    ) -> Result<(), Error> {
        let mut child = self.launcher.launch(slot)?;
        let pid = child.id();
        if let Some(pid) = pid {
            pids.insert(slot, pid);
        }
        info!(slot, pid, "worker started");
        let task = running.spawn(async move { child.wait().await });
        slots.insert(task.id(), slot);
        Ok(())
    }

    fn schedule(&self, slot: usize, respawns: &mut JoinSet<()>, slots: &mut Slots) {
        let delay = self.respawn_delay;
        let task = respawns.spawn(sleep(delay));
        slots.insert(task.id(), slot);
    }
}

/// The slot a finished task worked for, whether or not it joined cleanly.
fn slot_of<T>(slots: &mut Slots, joined: &Result<(Id, T), JoinError>) -> Option<usize> {
    let id = match joined {
        Ok((id, _)) => *id,
        Err(e) => e.id(),
    };
    slots.remove(&id)
}

/// Logs how a worker's wait task ended and returns the slot to relaunch.
fn exited(slots: &mut Slots, joined: Result<(Id, io::Result<ExitStatus>), JoinError>) -> Option<usize> {
    let slot = slot_of(slots, &joined)?;
    match joined {
        Ok((_, Ok(status))) => warn!(slot, %status, "worker exited; relaunching"),
        Ok((_, Err(e))) => error!(slot, error = %e, "lost track of worker; relaunching"),
        Err(e) => error!(slot, error = %e, "worker wait task failed; relaunching"),
    }
    Some(slot)
}

#[cfg(unix)]
fn terminate(pid: u32) {
    let Ok(pid) = libc::pid_t::try_from(pid) else { return };
    // SAFETY: `kill` has no memory-safety preconditions; a stale pid at
    // worst signals nothing.
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate(_pid: u32) {}
