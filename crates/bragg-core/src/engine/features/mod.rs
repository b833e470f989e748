//! # Feature Module
//!
//! Constraint updaters that run when their trigger fires in the compiled flow.
//!
//! Every feature implements [`Feature`]: given the current image (and, for reciprocal-space
//! features, the modeled amplitudes) it produces a [`FeatureUpdate`] that the engine applies
//! to its support or iteration data. Which features exist for a reconstruction is decided by
//! which trigger keys are configured; [`FeatureSet::build`] performs that selection.
//!
//! - **Shrink-wrap** ([`shrink_wrap`]) - Support from the smoothed image magnitude
//! - **Phase constraint** ([`phase`]) - Support restricted to a phase band
//! - **Low-pass filter** ([`lowpass`]) - Progressive-resolution data and support
//! - **Partial coherence** ([`coherence`]) - Richardson-Lucy coherence kernel

pub mod coherence;
pub mod lowpass;
pub mod phase;
pub mod shrink_wrap;

use super::config::ReconstructionConfig;
use super::flow::{Flow, FlowOp};
use ndarray::Array3;
use num_complex::Complex64;
use std::collections::HashMap;
use tracing::trace;

pub use coherence::PartialCoherence;
pub use lowpass::LowPassFilter;
pub use phase::PhaseConstraint;
pub use shrink_wrap::ShrinkWrap;

/// What a feature sees when its trigger fires.
pub struct FeatureContext<'a> {
    pub iteration: usize,
    pub image: &'a Array3<Complex64>,
    /// Full-resolution measured magnitude of the current generation.
    pub data: &'a Array3<f64>,
    /// Magnitude of the current reciprocal-space field, for reciprocal-space features.
    pub amplitudes: Option<&'a Array3<f64>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeatureUpdate {
    /// Replace the support wholesale.
    ReplaceSupport(Array3<bool>),
    /// Intersect the current support with a mask.
    RestrictSupport(Array3<bool>),
    /// Replace the data used by the modulus projection, together with a matching support.
    Resolution {
        data: Array3<f64>,
        support: Array3<bool>,
    },
    /// The feature only updated its own internal state.
    Internal,
}

pub trait Feature: Send {
    fn name(&self) -> &'static str;

    fn apply_trigger(&mut self, context: &FeatureContext) -> FeatureUpdate;
}

/// The support and data features of one reconstruction, keyed by the flow operation that
/// triggers them.
#[derive(Default)]
pub struct FeatureSet {
    features: HashMap<FlowOp, Box<dyn Feature>>,
}

impl FeatureSet {
    pub fn build(config: &ReconstructionConfig, flow: &Flow) -> Self {
        let mut features: HashMap<FlowOp, Box<dyn Feature>> = HashMap::new();
        if let Some(sw) = &config.shrink_wrap {
            features.insert(FlowOp::ShrinkWrap, Box::new(ShrinkWrap::new(sw)));
        }
        if let Some(phc) = &config.phase_constraint {
            features.insert(FlowOp::PhaseConstraint, Box::new(PhaseConstraint::new(phc)));
        }
        if let Some(lpf) = &config.lowpass {
            let fired = flow.firing_iterations(FlowOp::LowPassFilter);
            if let (Some(&start), Some(&stop)) = (fired.first(), fired.last()) {
                features.insert(
                    FlowOp::LowPassFilter,
                    Box::new(LowPassFilter::new(lpf, start, stop)),
                );
            }
        }
        Self { features }
    }

    /// Names of the armed features, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.features.values().map(|f| f.name()).collect();
        names.sort_unstable();
        names
    }

    /// Runs the feature bound to `op`, if any.
    pub fn apply(&mut self, op: FlowOp, context: &FeatureContext) -> Option<FeatureUpdate> {
        let feature = self.features.get_mut(&op)?;
        trace!(
            feature = feature.name(),
            iteration = context.iteration,
            "Feature triggered."
        );
        Some(feature.apply_trigger(context))
    }
}
