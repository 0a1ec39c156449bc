//! Local command console shared between firmware and emulator targets.
//!
//! Lines are tokenized in [`grammar`], described by the static [`catalog`],
//! applied by [`commands::ConsoleExecutor`], and rendered by [`status`].

pub mod catalog;
pub mod commands;
pub mod grammar;
pub mod status;

pub use commands::{ConsoleError, ConsoleExecutor, ConsoleOutcome};
pub use status::NodeStatus;
