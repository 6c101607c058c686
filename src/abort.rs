//! Cooperative cancellation
//!
//! An [`AbortController`] hands out [`AbortSignal`]s. The execution loop
//! checks the signal between iterations and the VM driver races it against
//! running scripts.

use tokio::sync::watch;

/// Sets the abort reason seen by every signal it handed out
#[derive(Debug, Clone)]
pub struct AbortController {
    tx: watch::Sender<Option<String>>,
}

impl AbortController {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Abort with a reason; later calls keep the first reason
    pub fn abort(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

/// Observes an [`AbortController`]
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<Option<String>>,
}

impl AbortSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(None);
        Self { rx }
    }

    pub fn is_aborted(&self) -> bool {
        self.rx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<String> {
        self.rx.borrow().clone()
    }

    /// Resolve with the reason once aborted; pending forever if the
    /// controller is dropped without aborting
    pub async fn aborted(&self) -> String {
        let mut rx = self.rx.clone();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::never()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_abort_sets_reason() {
        let controller = AbortController::new();
        let signal = controller.signal();
        assert!(!signal.is_aborted());
        controller.abort("user cancelled");
        assert!(signal.is_aborted());
        assert_eq!(signal.reason().as_deref(), Some("user cancelled"));
    }

    #[test]
    fn test_first_reason_wins() {
        let controller = AbortController::new();
        let signal = controller.signal();
        controller.abort("first");
        controller.abort("second");
        assert_eq!(signal.reason().as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_aborted_resolves() {
        let controller = AbortController::new();
        let signal = controller.signal();
        let waiter = tokio::spawn(async move { signal.aborted().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        controller.abort("stop");
        assert_eq!(waiter.await.unwrap(), "stop");
    }

    #[tokio::test]
    async fn test_never_stays_pending() {
        let signal = AbortSignal::never();
        let result = tokio::time::timeout(Duration::from_millis(20), signal.aborted()).await;
        assert!(result.is_err());
        assert!(!signal.is_aborted());
    }
}
