use async_trait::async_trait;
use tokio::sync::oneshot;

use super::binding::InlineBinding;
use super::driver::{self, SandboxBackend};
use super::sandbox::{self, EngineLimits, SandboxJob, SandboxReport};
use super::{VmBackend, VmDriver, VmExecutionResult, VmLimits, VmRequest};

/// Runs scripts on tokio's blocking pool
///
/// Timeouts and aborts stop the script at its next engine step, and the
/// driver waits for it so the partial variables are reported.
#[derive(Debug, Clone, Default)]
pub struct InlineDriver {
    _private: (),
}

impl InlineDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SandboxBackend for InlineDriver {
    type Binding = InlineBinding;

    fn kind(&self) -> VmBackend {
        VmBackend::Inline
    }

    fn binding(&self) -> InlineBinding {
        InlineBinding
    }

    fn engine_limits(&self, limits: &VmLimits) -> EngineLimits {
        EngineLimits::from_memory(limits.memory_limit_bytes)
    }

    fn spawn(&self, job: SandboxJob<InlineBinding>) -> oneshot::Receiver<SandboxReport> {
        let (tx, rx) = oneshot::channel();
        tokio::task::spawn_blocking(move || {
            let _ = tx.send(sandbox::run(job));
        });
        rx
    }

    fn waits_for_worker(&self) -> bool {
        true
    }
}

#[async_trait]
impl VmDriver for InlineDriver {
    fn backend(&self) -> VmBackend {
        VmBackend::Inline
    }

    async fn execute(&self, request: VmRequest) -> VmExecutionResult {
        driver::execute(self, request).await
    }
}
