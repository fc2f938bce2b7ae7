//! Unix process management for the powpeg harness: signals through nix,
//! process-tree discovery through sysinfo.

mod unix_process_manager;

use powpeg_harness_core::{ProcessManager, ProcessManagerFactory};

pub use unix_process_manager::{UnixProcessHandle, UnixProcessManager};

pub struct UnixProcessManagerFactory;

impl ProcessManagerFactory for UnixProcessManagerFactory {
    type Manager = UnixProcessManager;

    fn create_process_manager() -> UnixProcessManager {
        <UnixProcessManager as ProcessManager>::new()
    }

    fn platform_name() -> &'static str {
        "Unix"
    }
}
