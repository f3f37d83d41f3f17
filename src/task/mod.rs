//! Task execution engine.
//!
//! A job description (YAML) is parsed into a [`Task`]: named steps, each a list
//! of shell commands plus environment variables. [`Runner::execute`] runs the
//! commands in order, passing each step's environment to its children only,
//! stops at the first non-zero exit code and records everything in a
//! transcript file.

pub mod model;
pub mod runner;
pub mod transcript;

pub use model::{Step, Task};
pub use runner::{CommandResult, Runner, ShellKind, TaskReport};
pub use transcript::Transcript;
