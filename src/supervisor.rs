//! Capture worker process supervision.
//!
//! The core only needs `start(argv) -> pid` and `kill(pid)`. This module
//! defines that seam as a trait and provides the real implementation on
//! top of `std::process`.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

/// How long a worker gets to exit after each signal.
const KILL_GRACE: Duration = Duration::from_millis(100);

/// Interval between exit checks.
const REAP_POLL: Duration = Duration::from_millis(10);

/// Starts and stops capture workers.
///
/// `argv[0]` is the worker name as it should appear to the worker itself;
/// the rest are its arguments. `kill` must return in bounded time whatever
/// the worker does.
pub trait Supervisor: Send {
    fn start(&mut self, argv: &[String]) -> io::Result<u32>;

    fn kill(&mut self, pid: u32) -> io::Result<()>;
}

/// Spawns workers as child processes of the agent.
pub struct ProcessSupervisor {
    /// Executable to run for every worker.
    executable: PathBuf,
    /// Running children by pid.
    children: HashMap<u32, Child>,
    /// Killed children that had not exited yet.
    lingering: Vec<Child>,
    /// Wait after SIGTERM and again after SIGKILL.
    grace: Duration,
}

impl ProcessSupervisor {
    pub fn new(executable: impl AsRef<Path>) -> Self {
        Self {
            executable: executable.as_ref().to_path_buf(),
            children: HashMap::new(),
            lingering: Vec::new(),
            grace: KILL_GRACE,
        }
    }

    /// Set how long `kill` waits for the worker after each signal.
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Reap killed children that have exited since.
    fn reap_lingering(&mut self) {
        self.lingering.retain_mut(|child| match child.try_wait() {
            Ok(Some(status)) => {
                debug!("Reaped sniffer worker {}: {}", child.id(), status);
                false
            }
            Ok(None) => true,
            Err(e) => {
                debug!("Couldn't reap sniffer worker {}: {}", child.id(), e);
                false
            }
        });
    }
}

/// Poll `child` until it exits or `grace` runs out.
fn wait_for(child: &mut Child, grace: Duration) -> io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + grace;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(REAP_POLL);
    }
}

impl Supervisor for ProcessSupervisor {
    fn start(&mut self, argv: &[String]) -> io::Result<u32> {
        self.reap_lingering();
        let (name, args) = argv
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty worker argv"))?;

        let mut command = Command::new(&self.executable);
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.arg0(name);
        }
        #[cfg(not(unix))]
        let _ = name;

        let child = command
            .args(args)
            .stdin(Stdio::null())
            .spawn()?;
        let pid = child.id();
        debug!("Spawned {} as pid {}", self.executable.display(), pid);
        self.children.insert(pid, child);
        Ok(pid)
    }

    /// SIGTERM, then SIGKILL if the worker is still there after the grace
    /// period. A child that outlives both is reaped later.
    fn kill(&mut self, pid: u32) -> io::Result<()> {
        self.reap_lingering();
        terminate(pid)?;
        let Some(mut child) = self.children.remove(&pid) else {
            warn!("Sniffer worker {} was not started by this agent", pid);
            return Ok(());
        };

        if let Some(status) = wait_for(&mut child, self.grace)? {
            info!("Sniffer worker {} exited with {}", pid, status);
            return Ok(());
        }

        warn!("Sniffer worker {} ignored SIGTERM, sending SIGKILL", pid);
        if let Err(e) = child.kill() {
            warn!("Couldn't SIGKILL sniffer worker {}: {}", pid, e);
        }
        match wait_for(&mut child, self.grace)? {
            Some(status) => info!("Sniffer worker {} killed: {}", pid, status),
            None => {
                warn!("Sniffer worker {} still running, reaping later", pid);
                self.lingering.push(child);
            }
        }
        Ok(())
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        let running = self.children.drain().map(|(_, child)| child);
        for mut child in running.chain(self.lingering.drain(..)) {
            let pid = child.id();
            if let Err(e) = child.kill() {
                debug!("Couldn't kill worker {}: {}", pid, e);
            }
            match child.wait() {
                Ok(status) => debug!("Reaped worker {}: {}", pid, status),
                Err(e) => debug!("Couldn't reap worker {}: {}", pid, e),
            }
        }
    }
}

/// Ask the worker to stop so it can close its capture file cleanly.
#[cfg(unix)]
fn terminate(pid: u32) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill(2) has no memory-safety preconditions.
    let result = unsafe { libc::kill(pid, libc::SIGTERM) };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn terminate(_pid: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "signals are not supported on this platform",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_argv_is_rejected() {
        let mut sup = ProcessSupervisor::new("/bin/true");
        assert!(sup.start(&[]).is_err());
    }

    #[test]
    fn missing_executable_fails_to_start() {
        let mut sup = ProcessSupervisor::new("/nonexistent/te_sniffer_process");
        let argv = vec!["te_sniffer_process".to_string(), "-p".to_string()];
        assert!(sup.start(&argv).is_err());
    }

    #[test]
    #[cfg(unix)]
    fn worker_ignoring_sigterm_is_killed_in_bounded_time() {
        let mut sup = ProcessSupervisor::new("/bin/sh");
        let argv = vec![
            "te_sniffer_process".to_string(),
            "-c".to_string(),
            "trap '' TERM; sleep 30".to_string(),
        ];
        let pid = sup.start(&argv).unwrap();
        // Let the shell install its trap.
        thread::sleep(Duration::from_millis(300));

        let started = Instant::now();
        sup.kill(pid).unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(sup.children.is_empty());
        assert!(sup.lingering.is_empty());
    }

    #[test]
    #[cfg(unix)]
    fn lingering_children_are_reaped_later() {
        let mut sup = ProcessSupervisor::new("/bin/sh").with_grace_period(Duration::ZERO);
        let argv = vec![
            "te_sniffer_process".to_string(),
            "-c".to_string(),
            "trap '' TERM; sleep 30".to_string(),
        ];
        let pid = sup.start(&argv).unwrap();
        thread::sleep(Duration::from_millis(300));

        sup.kill(pid).unwrap();
        assert!(sup.children.is_empty());

        // SIGKILL has been sent; the next supervisor call picks it up.
        thread::sleep(Duration::from_millis(300));
        sup.reap_lingering();
        assert!(sup.lingering.is_empty());
    }

    #[test]
    #[cfg(unix)]
    fn drop_reaps_running_workers() {
        let mut sup = ProcessSupervisor::new("/bin/sleep");
        let argv = vec!["te_sniffer_process".to_string(), "30".to_string()];
        let pid = sup.start(&argv).unwrap();
        drop(sup);

        // Reaped, so the pid no longer names a process or zombie.
        let alive = unsafe { libc::kill(pid as libc::pid_t, 0) } == 0;
        assert!(!alive);
    }

    #[test]
    #[cfg(unix)]
    fn start_and_kill_a_worker() {
        let mut sup = ProcessSupervisor::new("/bin/sleep");
        let argv = vec!["te_sniffer_process".to_string(), "30".to_string()];
        let pid = sup.start(&argv).unwrap();
        assert!(pid > 0);
        sup.kill(pid).unwrap();
        assert!(sup.children.is_empty());
    }
}
