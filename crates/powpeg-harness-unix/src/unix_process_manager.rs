use anyhow::Result;
use async_trait::async_trait;
use powpeg_harness_core::{
    OutputSink, ProcessHandle, ProcessId, ProcessLifecycle, ProcessManager, ProcessSpec,
    ProcessStatus, ProcessTermination, TerminationResult,
};
use std::time::Duration;

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid as NixPid;
    use powpeg_harness_core::forward_lines;
    use std::process::Stdio;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex, PoisonError};
    use sysinfo::System;
    use tokio::process::Command;
    use tokio::sync::watch;
    use tracing::{debug, info, warn};

    /// Unix process handle.
    ///
    /// The `Child` itself lives in a watcher task that reaps it, clears the
    /// running flag and publishes the exit status.
    pub struct UnixProcessHandle {
        pid: ProcessId,
        command: String,
        args: Vec<String>,
        running: Arc<AtomicBool>,
        exit: watch::Receiver<Option<ProcessStatus>>,
    }

    impl UnixProcessHandle {
        fn nix_pid(&self) -> NixPid {
            NixPid::from_raw(self.pid.0 as i32)
        }
    }

    #[async_trait]
    impl ProcessHandle for UnixProcessHandle {
        fn pid(&self) -> Option<ProcessId> {
            self.running.load(Ordering::SeqCst).then_some(self.pid)
        }

        fn command(&self) -> &str {
            &self.command
        }

        fn args(&self) -> &[String] {
            &self.args
        }

        async fn is_running(&self) -> bool {
            if !self.running.load(Ordering::SeqCst) {
                return false;
            }
            // Signal 0 only checks that the process exists
            signal::kill(self.nix_pid(), None).is_ok()
        }

        async fn wait_for_exit(&self, timeout: Option<Duration>) -> Result<ProcessStatus> {
            let mut exit = self.exit.clone();
            let wait = async move {
                let status = exit
                    .wait_for(Option::is_some)
                    .await
                    .map(|status| status.clone())
                    .map_err(|_| anyhow::anyhow!("exit watcher for {} went away", self.pid))?;
                Ok::<_, anyhow::Error>(status.unwrap_or(ProcessStatus::Running))
            };
            match timeout {
                Some(duration) => tokio::time::timeout(duration, wait).await.map_err(|_| {
                    anyhow::anyhow!("Timeout waiting for process {} to exit", self.pid)
                })?,
                None => wait.await,
            }
        }
    }

    /// Unix-specific process manager with process tree management
    pub struct UnixProcessManager {
        system: Mutex<System>,
    }

    impl Default for UnixProcessManager {
        fn default() -> Self {
            <Self as ProcessManager>::new()
        }
    }

    fn send_signal(pid: ProcessId, sig: Signal) -> TerminationResult {
        match signal::kill(NixPid::from_raw(pid.0 as i32), sig) {
            Ok(()) => {
                info!("Sent {} to process {}", sig, pid);
                TerminationResult::Success
            }
            Err(nix::errno::Errno::ESRCH) => {
                debug!("Process {} not found (already terminated)", pid);
                TerminationResult::ProcessNotFound
            }
            Err(nix::errno::Errno::EPERM) => {
                warn!("Permission denied to signal process {}", pid);
                TerminationResult::AccessDenied
            }
            Err(e) => {
                warn!("Failed to send {} to process {}: {}", sig, pid, e);
                TerminationResult::Failed(format!("{sig} failed: {e}"))
            }
        }
    }

    #[async_trait]
    impl ProcessLifecycle for UnixProcessManager {
        type Handle = UnixProcessHandle;

        async fn spawn_process(
            &self,
            spec: &ProcessSpec,
            out: Option<OutputSink>,
            err: Option<OutputSink>,
        ) -> Result<UnixProcessHandle> {
            let mut cmd = Command::new(&spec.command);
            cmd.args(&spec.args);

            if let Some(dir) = &spec.working_directory {
                cmd.current_dir(dir);
            }
            for (key, value) in &spec.env {
                cmd.env(key, value);
            }

            cmd.stdin(Stdio::null())
                .stdout(if out.is_some() { Stdio::piped() } else { Stdio::null() })
                .stderr(if err.is_some() { Stdio::piped() } else { Stdio::null() })
                .kill_on_drop(true);

            // Own process group so a terminal Ctrl-C does not reach children
            cmd.process_group(0);

            let mut child = cmd
                .spawn()
                .map_err(|e| anyhow::anyhow!("Failed to spawn {}: {}", spec.command, e))?;
            let pid = child
                .id()
                .map(ProcessId)
                .ok_or_else(|| anyhow::anyhow!("{} exited before reporting a PID", spec.command))?;

            info!(
                "Spawned Unix process: {} (PID: {}) with args: {:?}",
                spec.command, pid, spec.args
            );

            if let (Some(stdout), Some(sink)) = (child.stdout.take(), out) {
                let label = spec.label.clone();
                tokio::spawn(async move {
                    if let Err(e) = forward_lines(stdout, sink, &label).await {
                        debug!(label = %label, error = %e, "stdout forwarding stopped");
                    }
                });
            }
            if let (Some(stderr), Some(sink)) = (child.stderr.take(), err) {
                let label = spec.label.clone();
                tokio::spawn(async move {
                    if let Err(e) = forward_lines(stderr, sink, &label).await {
                        debug!(label = %label, error = %e, "stderr forwarding stopped");
                    }
                });
            }

            let running = Arc::new(AtomicBool::new(true));
            let (exit_tx, exit_rx) = watch::channel(None);
            {
                let running = running.clone();
                let label = spec.label.clone();
                tokio::spawn(async move {
                    let status = match child.wait().await {
                        Ok(status) => ProcessStatus::Exited(status),
                        Err(e) => ProcessStatus::Failed(e.to_string()),
                    };
                    running.store(false, Ordering::SeqCst);
                    info!(label = %label, pid = %pid, status = ?status, "process exited");
                    let _ = exit_tx.send(Some(status));
                });
            }

            Ok(UnixProcessHandle {
                pid,
                command: spec.command.clone(),
                args: spec.args.clone(),
                running,
                exit: exit_rx,
            })
        }
    }

    #[async_trait]
    impl ProcessTermination for UnixProcessManager {
        async fn terminate_gracefully(&self, handle: &dyn ProcessHandle) -> TerminationResult {
            match handle.pid() {
                Some(pid) => send_signal(pid, Signal::SIGTERM),
                None => TerminationResult::ProcessNotFound,
            }
        }

        async fn force_kill(&self, handle: &dyn ProcessHandle) -> TerminationResult {
            match handle.pid() {
                Some(pid) => send_signal(pid, Signal::SIGKILL),
                None => TerminationResult::ProcessNotFound,
            }
        }

        async fn find_child_processes(&self, parent_pid: ProcessId) -> Result<Vec<ProcessId>> {
            let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
            system.refresh_processes_specifics(
                sysinfo::ProcessesToUpdate::All,
                true,
                sysinfo::ProcessRefreshKind::default(),
            );

            let mut children = Vec::new();
            Self::find_children_recursive(&system, parent_pid.0, &mut children);

            Ok(children.into_iter().map(ProcessId).collect())
        }

        async fn terminate_process_tree(&self, root_pid: ProcessId) -> TerminationResult {
            info!("Terminating process tree for root PID {}", root_pid);

            let children = match self.find_child_processes(root_pid).await {
                Ok(children) => children,
                Err(e) => {
                    warn!("Failed to find child processes for PID {}: {}", root_pid, e);
                    return TerminationResult::Failed(format!("Failed to enumerate children: {e}"));
                }
            };

            // Deepest descendants come first
            for child_pid in &children {
                let result = send_signal(*child_pid, Signal::SIGTERM);
                if !result.is_success() {
                    warn!("Failed to terminate child process {}: {:?}", child_pid, result);
                }
            }

            send_signal(root_pid, Signal::SIGTERM)
        }
    }

    impl UnixProcessManager {
        /// Recursively find all child processes, grandchildren first
        fn find_children_recursive(system: &System, parent_pid: u32, result: &mut Vec<u32>) {
            for (pid, process) in system.processes() {
                if process.parent().map(|ppid| ppid.as_u32()) == Some(parent_pid) {
                    let child_pid = pid.as_u32();
                    Self::find_children_recursive(system, child_pid, result);
                    result.push(child_pid);
                }
            }
        }
    }

    impl ProcessManager for UnixProcessManager {
        fn new() -> Self {
            info!("Initializing Unix process manager");
            Self {
                system: Mutex::new(System::new()),
            }
        }
    }
}

#[cfg(unix)]
pub use unix_impl::{UnixProcessHandle, UnixProcessManager};
