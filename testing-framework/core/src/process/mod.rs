//! Subprocess plumbing: one-shot command execution with captured output and
//! long-running daemons whose output is drained in the background.

pub mod binary;
pub mod daemon;
pub mod runner;

pub use binary::{BinaryConfig, BinaryResolver, TahoeCommand};
pub use daemon::{DaemonError, DaemonHandle, OutputLine, OutputSink, OutputStream, spawn_daemon};
pub use runner::{CommandSpec, ProcessError, ProcessResult, StderrMode, run};
