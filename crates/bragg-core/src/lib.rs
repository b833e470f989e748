//! # Bragg CDI Core Library
//!
//! Iterative phase retrieval for three-dimensional Bragg coherent diffraction imaging.
//! Given a measured diffraction magnitude, the library recovers the complex-valued object
//! by alternating projections between reciprocal space (where the magnitude is known) and
//! direct space (where the object is confined to a support).
//!
//! ## Architectural Philosophy
//!
//! The library follows a strict three-layer architecture:
//!
//! - **[`core`]: The Foundation.** Stateless numerics: 3D grid operations (rolls, Gaussian
//!   filtering, center of mass), the 3D FFT, fitness metrics, and array file I/O.
//!
//! - **[`engine`]: The Logic Core.** The stateful reconstruction engine with its compiled
//!   operation flow, pluggable constraint features (shrink-wrap, phase constraint, low-pass
//!   filter, partial coherence), breeding rules, and the device resource allocator.
//!
//! - **[`workflows`]: The Public API.** Complete procedures built on the engine: a single
//!   reconstruction, a queue-driven multi reconstruction, and the genetic-algorithm drivers
//!   that evolve a population of reconstructions toward a consensus result.

pub mod core;
pub mod engine;
pub mod workflows;
