#![no_std]

// Shared logic for the battery telemetry node.
//
// This crate stays portable across device firmware and host tooling by avoiding
// the Rust standard library. Radio, broker, flash and sensor access are reached
// through the traits exposed by each module.

pub mod channel;
pub mod clock;
pub mod config;
pub mod console;
pub mod dispatch;
pub mod journal;
pub mod orchestrator;
pub mod retained;
pub mod storage;
pub mod telemetry;
pub mod trigger;
pub mod update;
pub mod version;
