use crate::config::ProcessSpec;
use crate::output::OutputSink;
use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

/// Unique identifier for a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(pub u32);

impl From<u32> for ProcessId {
    fn from(pid: u32) -> Self {
        ProcessId(pid)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a supervised process
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessStatus {
    /// Process is currently running
    Running,
    /// Process exited with status information
    Exited(std::process::ExitStatus),
    /// The exit status could not be collected
    Failed(String),
}

/// Result of a process termination operation
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationResult {
    /// Process was successfully signalled
    Success,
    /// Process was not found (already exited)
    ProcessNotFound,
    /// Permission denied (insufficient privileges)
    AccessDenied,
    /// Operation failed with specific error message
    Failed(String),
}

impl TerminationResult {
    /// `true` when the process is gone or on its way out
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            TerminationResult::Success | TerminationResult::ProcessNotFound
        )
    }
}

/// How a runner asks its process to go away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// SIGTERM, escalating to SIGKILL after a grace period
    Graceful,
    /// SIGKILL straight away
    Force,
}

/// Trait representing a handle to a spawned process
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// Get the process ID (None once the process has been reaped)
    fn pid(&self) -> Option<ProcessId>;

    fn command(&self) -> &str;

    fn args(&self) -> &[String];

    /// Non-blocking liveness check
    async fn is_running(&self) -> bool;

    /// Wait for the process to exit, giving up after `timeout` if one is set
    async fn wait_for_exit(&self, timeout: Option<Duration>) -> Result<ProcessStatus>;
}

/// Spawning side of process management
#[async_trait]
pub trait ProcessLifecycle: Send + Sync {
    /// The type of process handle this lifecycle manager produces
    type Handle: ProcessHandle;

    /// Spawn `spec`, forwarding its stdout/stderr into the given sinks.
    /// Streams without a sink are discarded.
    async fn spawn_process(
        &self,
        spec: &ProcessSpec,
        out: Option<OutputSink>,
        err: Option<OutputSink>,
    ) -> Result<Self::Handle>;
}

/// Trait for process termination, including process trees
#[async_trait]
pub trait ProcessTermination: Send + Sync {
    /// Terminate a single process gracefully (SIGTERM on Unix)
    async fn terminate_gracefully(&self, handle: &dyn ProcessHandle) -> TerminationResult;

    /// Force kill a single process (SIGKILL on Unix)
    async fn force_kill(&self, handle: &dyn ProcessHandle) -> TerminationResult;

    /// Find all descendants of a given process
    async fn find_child_processes(&self, pid: ProcessId) -> Result<Vec<ProcessId>>;

    /// Terminate an entire process tree (descendants first, then the root)
    async fn terminate_process_tree(&self, root_pid: ProcessId) -> TerminationResult;

    /// Stop `handle` with `signal` and wait for it to exit.
    ///
    /// A graceful stop that has not finished after `grace` is escalated to
    /// SIGKILL.
    async fn terminate(
        &self,
        handle: &dyn ProcessHandle,
        signal: StopSignal,
        grace: Duration,
    ) -> TerminationResult {
        let pid = handle.pid();
        let result = match signal {
            StopSignal::Graceful => self.terminate_gracefully(handle).await,
            StopSignal::Force => self.force_kill(handle).await,
        };

        match result {
            TerminationResult::ProcessNotFound => return TerminationResult::Success,
            TerminationResult::Success => {}
            other => {
                warn!(pid = ?pid, result = ?other, "signal failed, forcing kill");
                return self.force_kill(handle).await;
            }
        }

        match handle.wait_for_exit(Some(grace)).await {
            Ok(status) => {
                info!(pid = ?pid, status = ?status, "process exited");
                TerminationResult::Success
            }
            Err(_) if signal == StopSignal::Graceful => {
                warn!(pid = ?pid, "process ignored SIGTERM for {:?}, sending SIGKILL", grace);
                let killed = self.force_kill(handle).await;
                if killed.is_success() {
                    let _ = handle.wait_for_exit(Some(grace)).await;
                }
                killed
            }
            Err(e) => TerminationResult::Failed(format!("process did not exit: {e}")),
        }
    }
}

/// Process manager combining spawning and termination
pub trait ProcessManager: ProcessLifecycle + ProcessTermination {
    /// Create a new process manager instance
    fn new() -> Self
    where
        Self: Sized;
}

/// Factory trait for creating platform-specific process managers
pub trait ProcessManagerFactory {
    /// The type of process manager this factory creates
    type Manager: ProcessManager;

    /// Create a process manager for the current platform
    fn create_process_manager() -> Self::Manager;

    /// Get the platform name for logging and debugging
    fn platform_name() -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    /// A process that stays alive until something flips its flag.
    struct Stubborn {
        alive: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ProcessHandle for Stubborn {
        fn pid(&self) -> Option<ProcessId> {
            Some(ProcessId(42))
        }
        fn command(&self) -> &str {
            "stubborn"
        }
        fn args(&self) -> &[String] {
            &[]
        }
        async fn is_running(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
        async fn wait_for_exit(&self, _timeout: Option<Duration>) -> Result<ProcessStatus> {
            if self.alive.load(Ordering::SeqCst) {
                anyhow::bail!("timed out")
            }
            Ok(ProcessStatus::Failed("signalled".into()))
        }
    }

    struct Recorder {
        alive: Arc<AtomicBool>,
        ignore_term: bool,
        signals: Mutex<Vec<&'static str>>,
    }

    impl Recorder {
        fn new(ignore_term: bool) -> (Self, Stubborn) {
            let alive = Arc::new(AtomicBool::new(true));
            let recorder = Recorder {
                alive: alive.clone(),
                ignore_term,
                signals: Mutex::new(Vec::new()),
            };
            (recorder, Stubborn { alive })
        }
    }

    #[async_trait]
    impl ProcessTermination for Recorder {
        async fn terminate_gracefully(&self, _handle: &dyn ProcessHandle) -> TerminationResult {
            self.signals.lock().unwrap().push("TERM");
            if !self.ignore_term {
                self.alive.store(false, Ordering::SeqCst);
            }
            TerminationResult::Success
        }
        async fn force_kill(&self, _handle: &dyn ProcessHandle) -> TerminationResult {
            self.signals.lock().unwrap().push("KILL");
            self.alive.store(false, Ordering::SeqCst);
            TerminationResult::Success
        }
        async fn find_child_processes(&self, _pid: ProcessId) -> Result<Vec<ProcessId>> {
            Ok(vec![])
        }
        async fn terminate_process_tree(&self, _root: ProcessId) -> TerminationResult {
            TerminationResult::Success
        }
    }

    #[tokio::test]
    async fn test_graceful_stop_does_not_escalate() {
        let (recorder, handle) = Recorder::new(false);
        let result = recorder
            .terminate(&handle, StopSignal::Graceful, Duration::from_millis(10))
            .await;
        assert_eq!(result, TerminationResult::Success);
        assert_eq!(*recorder.signals.lock().unwrap(), vec!["TERM"]);
    }

    #[tokio::test]
    async fn test_ignored_sigterm_escalates_to_sigkill() {
        let (recorder, handle) = Recorder::new(true);
        let result = recorder
            .terminate(&handle, StopSignal::Graceful, Duration::from_millis(10))
            .await;
        assert!(result.is_success());
        assert!(!handle.is_running().await);
        assert_eq!(*recorder.signals.lock().unwrap(), vec!["TERM", "KILL"]);
    }

    #[tokio::test]
    async fn test_force_stop_sends_only_sigkill() {
        let (recorder, handle) = Recorder::new(false);
        recorder
            .terminate(&handle, StopSignal::Force, Duration::from_millis(10))
            .await;
        assert_eq!(*recorder.signals.lock().unwrap(), vec!["KILL"]);
    }
}
