//! # Workflows Module
//!
//! Top-level entry points that tie the engine and core layers into complete runs.
//!
//! ## Architecture
//!
//! - **Single Reconstruction** ([`single`]) - One engine, one device slot, one result directory
//! - **Multi Reconstruction** ([`multi`]) - Independent jobs fed to device-slot threads through a
//!   shared queue, with cooperative interruption
//! - **Genetic Algorithm** ([`ga`]) - One member per device slot, coordinated by message passing
//! - **Populous GA** ([`populous`]) - Generation batches written to per-generation directories
//! - **Launch** ([`launch`]) - Job-size estimation, allocation, and dispatch to the above

pub mod ga;
pub mod launch;
pub mod multi;
pub mod populous;
pub mod single;

pub use launch::{LaunchOutcome, launch};
pub use multi::Interrupt;
