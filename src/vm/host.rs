//! Blocking host calls from the sandbox thread
//!
//! The sandbox sends a [`HostCall`] over a tokio channel and parks on a std
//! channel until the async driver replies. If the driver has gone away the
//! call returns `None` and the script is terminated.

use std::sync::mpsc;

use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;

use crate::domain::{Signal, ToolCallAssignment};
use crate::tools::ToolImplementation;

#[derive(Debug)]
pub(crate) enum HostRequest {
    Tool {
        tool: ToolImplementation,
        object: Option<String>,
        input: Value,
        assignment: Option<ToolCallAssignment>,
        line: Option<u32>,
    },
    Yield {
        value: Value,
    },
}

#[derive(Debug)]
pub(crate) enum HostReply {
    Value(Value),
    Signal(Signal),
    Error(String),
}

#[derive(Debug)]
pub(crate) struct HostCall {
    pub request: HostRequest,
    pub reply: mpsc::Sender<HostReply>,
}

#[derive(Debug, Clone)]
pub(crate) struct HostChannel {
    tx: UnboundedSender<HostCall>,
}

impl HostChannel {
    pub fn new(tx: UnboundedSender<HostCall>) -> Self {
        Self { tx }
    }

    /// Send a request and block until the driver replies
    pub fn call(&self, request: HostRequest) -> Option<HostReply> {
        let (reply, rx) = mpsc::channel();
        self.tx.send(HostCall { request, reply }).ok()?;
        rx.recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_roundtrip() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let channel = HostChannel::new(tx);

        let server = std::thread::spawn(move || {
            let call: HostCall = rx.blocking_recv().unwrap();
            assert!(matches!(call.request, HostRequest::Yield { .. }));
            call.reply.send(HostReply::Value(json!("ok"))).unwrap();
        });

        let reply = channel.call(HostRequest::Yield { value: json!(1) });
        assert!(matches!(reply, Some(HostReply::Value(v)) if v == json!("ok")));
        server.join().unwrap();
    }

    #[test]
    fn test_call_fails_when_driver_is_gone() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        drop(rx);
        let channel = HostChannel::new(tx);
        assert!(channel.call(HostRequest::Yield { value: json!(1) }).is_none());
    }

    #[test]
    fn test_call_fails_when_reply_is_dropped() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<HostCall>();
        let channel = HostChannel::new(tx);
        let server = std::thread::spawn(move || {
            let call = rx.blocking_recv().unwrap();
            drop(call);
        });
        assert!(channel.call(HostRequest::Yield { value: json!(1) }).is_none());
        server.join().unwrap();
    }
}
