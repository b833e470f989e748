//! # Engine Module
//!
//! Stateful phase-retrieval logic: configuration, flow compilation, constraint features, the
//! per-reconstruction state machine, breeding, and the device-slot allocator.
//!
//! ## Architecture
//!
//! - **Configuration** ([`config`]) - Typed reconstruction and GA parameters with a builder
//! - **Flow Compilation** ([`flow`]) - Algorithm grammar and trigger scheduling into a flat op list
//! - **Features** ([`features`]) - Shrink-wrap, phase constraint, low-pass filter, partial coherence
//! - **Reconstruction** ([`reconstruction`]) - The engine state machine that runs a compiled flow
//! - **Breeding** ([`breeding`]) - Crossover of a member with the generation's alpha
//! - **Allocation** ([`allocator`]) - Memory-aware distribution of jobs over device slots
//! - **Progress Monitoring** ([`progress`]) - Callback-based progress events
//! - **Error Handling** ([`error`]) - Engine error type shared by the workflows

pub mod allocator;
pub mod breeding;
pub mod config;
pub mod error;
pub mod features;
pub mod flow;
pub mod progress;
pub mod reconstruction;
