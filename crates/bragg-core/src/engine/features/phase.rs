use super::{Feature, FeatureContext, FeatureUpdate};
use crate::engine::config::PhaseConstraintConfig;

/// Excludes voxels whose phase falls outside the open band `(phase_min, phase_max)`.
#[derive(Debug, Clone)]
pub struct PhaseConstraint {
    phase_min: f64,
    phase_max: f64,
}

impl PhaseConstraint {
    pub fn new(config: &PhaseConstraintConfig) -> Self {
        Self {
            phase_min: config.phase_min,
            phase_max: config.phase_max,
        }
    }
}

impl Feature for PhaseConstraint {
    fn name(&self) -> &'static str {
        "phase_constraint"
    }

    fn apply_trigger(&mut self, context: &FeatureContext) -> FeatureUpdate {
        let mask = context.image.mapv(|c| {
            let phase = c.arg();
            phase > self.phase_min && phase < self.phase_max
        });
        FeatureUpdate::RestrictSupport(mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use num_complex::Complex64;

    #[test]
    fn mask_keeps_only_the_phase_band() {
        let mut image = Array3::from_elem((2, 1, 1), Complex64::from_polar(1.0, 0.2));
        image[[1, 0, 0]] = Complex64::from_polar(1.0, 2.5);
        let data = Array3::<f64>::zeros((2, 1, 1));
        let mut feature = PhaseConstraint::new(&PhaseConstraintConfig::default());
        let update = feature.apply_trigger(&FeatureContext {
            iteration: 0,
            image: &image,
            data: &data,
            amplitudes: None,
        });
        let FeatureUpdate::RestrictSupport(mask) = update else {
            panic!("phase constraint must restrict the support");
        };
        assert!(mask[[0, 0, 0]]);
        assert!(!mask[[1, 0, 0]]);
    }
}
