//! Cancellation registry.
//!
//! Tracks, per job id:
//! - a [`CancellationToken`] acting as the cancellation mark
//! - the live external process of the running stage, if any
//!
//! Entries are owned by the job's supervisor: [`CancellationRegistry::register`]
//! returns a guard that removes both entries when the supervisor finishes, and
//! [`CancellationRegistry::track_process`] returns a guard that forgets the
//! process as soon as the stage exits. Cancel requests only ever add marks.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The externally visible part of a running stage process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveProcess {
    /// OS process id, `None` if the process already exited when registered
    pub pid: Option<u32>,
}

#[derive(Debug, Default)]
pub struct CancellationRegistry {
    marks: RwLock<HashMap<Uuid, CancellationToken>>,
    processes: RwLock<HashMap<Uuid, LiveProcess>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the registry entries for a job's supervisor run.
    ///
    /// Keeps any mark a cancel request already placed.
    pub fn register(self: &Arc<Self>, job_id: Uuid) -> Registration {
        Registration {
            registry: Arc::clone(self),
            job_id,
            token: self.token(job_id),
        }
    }

    /// The job's cancellation token, created on first use.
    pub fn token(&self, job_id: Uuid) -> CancellationToken {
        self.marks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(job_id)
            .or_default()
            .clone()
    }

    /// Mark a job cancelled and signal its live process.
    ///
    /// Returns `true` if a stage process was running and got signalled,
    /// `false` if the mark will only be seen at the next checkpoint.
    pub fn request_cancel(&self, job_id: Uuid) -> bool {
        self.token(job_id).cancel();

        let live = self
            .processes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&job_id)
            .copied();

        match live {
            Some(process) => {
                if let Some(pid) = process.pid {
                    terminate(pid);
                }
                info!(job_id = %job_id, pid = ?process.pid, "cancellation requested, stage signalled");
                true
            }
            None => {
                debug!(job_id = %job_id, "cancellation requested, no live stage");
                false
            }
        }
    }

    /// Whether a cancellation mark exists for the job.
    pub fn is_canceled(&self, job_id: Uuid) -> bool {
        self.marks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&job_id)
            .is_some_and(|token| token.is_cancelled())
    }

    /// Whether a stage process is currently registered for the job.
    pub fn has_live_process(&self, job_id: Uuid) -> bool {
        self.processes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&job_id)
    }

    /// Number of jobs holding a mark entry.
    pub fn tracked_jobs(&self) -> usize {
        self.marks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Expose a freshly launched stage process to cancel requests.
    pub fn track_process(self: &Arc<Self>, job_id: Uuid, pid: Option<u32>) -> ProcessGuard {
        self.processes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job_id, LiveProcess { pid });
        ProcessGuard {
            registry: Arc::clone(self),
            job_id,
        }
    }

    fn forget_process(&self, job_id: Uuid) {
        self.processes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&job_id);
    }

    fn release(&self, job_id: Uuid) {
        self.forget_process(job_id);
        self.marks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&job_id);
    }
}

/// A supervisor's claim on a job's registry entries.
///
/// Dropping it removes the job's mark and live-process entry.
#[derive(Debug)]
pub struct Registration {
    registry: Arc<CancellationRegistry>,
    job_id: Uuid,
    token: CancellationToken,
}

impl Registration {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.release(self.job_id);
    }
}

/// Live-process entry for one stage, removed on drop.
#[derive(Debug)]
pub struct ProcessGuard {
    registry: Arc<CancellationRegistry>,
    job_id: Uuid,
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        self.registry.forget_process(self.job_id);
    }
}

/// Ask a stage to exit: SIGTERM to its process group, so helpers it spawned
/// go down with it. Returns whether the signal was delivered.
///
/// A process that already exited is not an error.
#[cfg(unix)]
pub(crate) fn terminate(pid: u32) -> bool {
    signal_group(pid, nix::sys::signal::Signal::SIGTERM)
}

/// SIGKILL the stage's process group.
#[cfg(unix)]
pub(crate) fn kill_group(pid: u32) -> bool {
    signal_group(pid, nix::sys::signal::Signal::SIGKILL)
}

/// Stages lead their own process group, so the group id is the pid.
#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            warn!(pid, signal = %signal, error = %e, "failed to signal stage process group");
            false
        }
    }
}

/// No graceful signal off Unix; the runner falls back to killing its child.
#[cfg(not(unix))]
pub(crate) fn terminate(_pid: u32) -> bool {
    false
}

#[cfg(not(unix))]
pub(crate) fn kill_group(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_before_register_is_kept() {
        let registry = Arc::new(CancellationRegistry::new());
        let job_id = Uuid::new_v4();

        assert!(!registry.request_cancel(job_id));
        let registration = registry.register(job_id);

        assert!(registration.token().is_cancelled());
        assert!(registry.is_canceled(job_id));
    }

    #[test]
    fn registration_drop_clears_mark_and_process() {
        let registry = Arc::new(CancellationRegistry::new());
        let job_id = Uuid::new_v4();

        let registration = registry.register(job_id);
        let process = registry.track_process(job_id, None);
        registry.request_cancel(job_id);
        assert!(registry.has_live_process(job_id));

        drop(process);
        assert!(!registry.has_live_process(job_id));
        assert!(registry.is_canceled(job_id));

        drop(registration);
        assert!(!registry.is_canceled(job_id));
        assert_eq!(registry.tracked_jobs(), 0);
    }

    #[test]
    fn cancel_with_live_process_reports_signal() {
        let registry = Arc::new(CancellationRegistry::new());
        let job_id = Uuid::new_v4();
        let _registration = registry.register(job_id);
        let _process = registry.track_process(job_id, None);

        assert!(registry.request_cancel(job_id));
        // Repeated requests stay harmless.
        assert!(registry.request_cancel(job_id));
    }

    #[test]
    fn unknown_job_is_not_canceled() {
        let registry = CancellationRegistry::new();
        assert!(!registry.is_canceled(Uuid::new_v4()));
    }

    #[cfg(unix)]
    #[test]
    fn terminating_an_exited_process_is_not_an_error() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        // Reaped, so the pid no longer names a process.
        assert!(!terminate(pid));
    }
}
