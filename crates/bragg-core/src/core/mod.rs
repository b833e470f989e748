//! # Core Module
//!
//! Stateless numerical building blocks shared by the engine and the workflows.
//!
//! ## Architecture
//!
//! - **Grid Operations** ([`grid`]) - Rolls, FFT shifts, center of mass, separable Gaussian
//!   filtering, shrink-wrap thresholding and centered crops/pads on 3D arrays
//! - **Fourier Transforms** ([`fft`]) - Planned 3D complex FFT with lane-parallel execution
//! - **Fitness Metrics** ([`metrics`]) - Scalar quality measures of a reconstructed image
//! - **File I/O** ([`io`]) - Reading and writing of the generic binary array format
//!
//! ## Conventions
//!
//! All volumes are `ndarray::Array3`. Complex values are `num_complex::Complex64`. The forward
//! transform is unnormalized and the inverse transform carries the `1/N` factor, so a random
//! image scaled to `‖data‖ / √N` has a forward transform of the same energy as the data.

pub mod fft;
pub mod grid;
pub mod io;
pub mod metrics;
