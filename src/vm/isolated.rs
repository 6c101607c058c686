use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::oneshot;

use super::binding::IsolatedBinding;
use super::driver::{self, SandboxBackend};
use super::sandbox::{self, EngineLimits, SandboxJob, SandboxReport};
use super::{VmBackend, VmDriver, VmExecutionResult, VmLimits, VmRequest};

const MAX_CALL_LEVELS: usize = 64;
const MAX_EXPR_DEPTH: usize = 64;
const MAX_FUNCTION_EXPR_DEPTH: usize = 32;

static WORKER_SEQ: AtomicU64 = AtomicU64::new(0);

/// Runs each script on its own OS thread with tighter engine limits
///
/// Values cross the boundary as JSON bytes. On timeout or abort the driver
/// stops waiting at once and the thread winds down on its own; partial
/// variables are not reported.
#[derive(Debug, Clone, Default)]
pub struct IsolatedDriver {
    _private: (),
}

impl IsolatedDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SandboxBackend for IsolatedDriver {
    type Binding = IsolatedBinding;

    fn kind(&self) -> VmBackend {
        VmBackend::Isolated
    }

    fn binding(&self) -> IsolatedBinding {
        IsolatedBinding
    }

    fn engine_limits(&self, limits: &VmLimits) -> EngineLimits {
        EngineLimits {
            max_call_levels: Some(MAX_CALL_LEVELS),
            max_expr_depths: Some((MAX_EXPR_DEPTH, MAX_FUNCTION_EXPR_DEPTH)),
            ..EngineLimits::from_memory(limits.memory_limit_bytes)
        }
    }

    fn spawn(&self, job: SandboxJob<IsolatedBinding>) -> oneshot::Receiver<SandboxReport> {
        let (tx, rx) = oneshot::channel();
        let name = format!("codeloop-vm-{}", WORKER_SEQ.fetch_add(1, Ordering::Relaxed));
        let spawned = std::thread::Builder::new().name(name).spawn(move || {
            let _ = tx.send(sandbox::run(job));
        });
        if let Err(e) = spawned {
            // Dropping the sender reports the worker as lost
            log::error!("Failed to spawn sandbox thread: {}", e);
        }
        rx
    }

    fn waits_for_worker(&self) -> bool {
        false
    }
}

#[async_trait]
impl VmDriver for IsolatedDriver {
    fn backend(&self) -> VmBackend {
        VmBackend::Isolated
    }

    async fn execute(&self, request: VmRequest) -> VmExecutionResult {
        driver::execute(self, request).await
    }
}
