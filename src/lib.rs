//! codeloop - runs model-written scripts in a bounded sandbox
//!
//! A language model drives execution by writing short Rhai scripts. Each
//! script is compiled, run inside a resource-bounded sandbox and classified
//! by the signals it raises: think again, wait for input, hand off, or pause
//! for an external tool. The execution loop repeats until a final action,
//! and interrupted runs resume from serializable snapshots.

pub mod abort;
pub mod compiler;
pub mod config;
pub mod domain;
pub mod error;
pub mod id;
pub mod llm;
pub mod objects;
pub mod protocol;
pub mod runner;
pub mod snapshot;
pub mod tools;
pub mod vm;

pub use error::{CodeloopError, Result};
