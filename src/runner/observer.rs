//! Hooks for watching a run as it happens

use crate::domain::{Iteration, Trace};

/// Receives traces and finished iterations while the loop runs
pub trait ExecutionObserver: Send + Sync {
    /// Called for every trace as it is pushed
    fn on_trace(&self, _trace: &Trace) {}

    /// Called after each iteration, before it is appended to history
    fn on_iteration_end(&self, _iteration: &Iteration) {}
}

/// Observer that ignores everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpObserver;

impl ExecutionObserver for NoOpObserver {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl ExecutionObserver for Recorder {
        fn on_trace(&self, trace: &Trace) {
            self.seen.lock().unwrap().push(trace.type_name().to_string());
        }
    }

    #[test]
    fn test_default_hooks_are_noops() {
        let observer = NoOpObserver;
        observer.on_trace(&Trace::log("hello", vec![]));
    }

    #[test]
    fn test_custom_observer_records_traces() {
        let recorder = Recorder {
            seen: Mutex::new(Vec::new()),
        };
        recorder.on_trace(&Trace::log("a", vec![]));
        assert_eq!(*recorder.seen.lock().unwrap(), vec!["log".to_string()]);
    }
}
