use powpeg_harness_core::ProcessManagerFactory;
use tracing::info;

#[cfg(unix)]
type PlatformFactory = powpeg_harness_unix::UnixProcessManagerFactory;

#[cfg(not(unix))]
compile_error!("Unsupported platform: powpeg-harness only runs on Unix targets");

/// Process manager for the target platform
pub type PlatformProcessManager = <PlatformFactory as ProcessManagerFactory>::Manager;

/// Handle type produced by [`PlatformProcessManager`]
pub type PlatformProcessHandle =
    <PlatformProcessManager as powpeg_harness_core::ProcessLifecycle>::Handle;

/// Selects the platform process manager at compile time
pub struct PlatformProcessManagerFactory;

impl PlatformProcessManagerFactory {
    pub fn create_process_manager() -> PlatformProcessManager {
        info!("Creating {} process manager", Self::platform_name());
        PlatformFactory::create_process_manager()
    }

    pub fn platform_name() -> &'static str {
        PlatformFactory::platform_name()
    }
}
