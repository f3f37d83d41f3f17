//! Remote agent: polls mailboxes for job bundles, runs them, mails back results.

pub mod archive;
pub mod bus;
pub mod config;
pub mod daemon;
pub mod error;
pub mod mail;
pub mod task;

pub use config::AgentConfig;
pub use daemon::{Daemon, DaemonHandle, DaemonState};
pub use error::{Error, ErrorKind, Result};
