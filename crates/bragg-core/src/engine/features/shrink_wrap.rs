use super::{Feature, FeatureContext, FeatureUpdate};
use crate::core::grid;
use crate::engine::config::{ShrinkWrapConfig, ShrinkWrapKind};

/// Replaces the support with the thresholded, Gaussian-smoothed image magnitude.
#[derive(Debug, Clone)]
pub struct ShrinkWrap {
    kind: ShrinkWrapKind,
    threshold: f64,
    sigma: f64,
}

impl ShrinkWrap {
    pub fn new(config: &ShrinkWrapConfig) -> Self {
        Self {
            kind: config.kind,
            threshold: config.threshold,
            sigma: config.sigma,
        }
    }
}

impl Feature for ShrinkWrap {
    fn name(&self) -> &'static str {
        "shrink_wrap"
    }

    fn apply_trigger(&mut self, context: &FeatureContext) -> FeatureUpdate {
        match self.kind {
            ShrinkWrapKind::Gauss => FeatureUpdate::ReplaceSupport(grid::shrink_wrap(
                context.image,
                self.threshold,
                self.sigma,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use num_complex::Complex64;

    #[test]
    fn support_tracks_the_object_not_the_previous_support() {
        let mut image = Array3::<Complex64>::zeros((10, 10, 10));
        image[[2, 2, 2]] = Complex64::new(5.0, 0.0);
        let data = Array3::<f64>::zeros((10, 10, 10));
        let mut feature = ShrinkWrap::new(&ShrinkWrapConfig {
            threshold: 0.5,
            sigma: 0.5,
            ..ShrinkWrapConfig::default()
        });
        let update = feature.apply_trigger(&FeatureContext {
            iteration: 3,
            image: &image,
            data: &data,
            amplitudes: None,
        });
        let FeatureUpdate::ReplaceSupport(support) = update else {
            panic!("shrink-wrap must replace the support");
        };
        assert!(support[[2, 2, 2]]);
        assert_eq!(support.iter().filter(|&&v| v).count(), 1);
    }
}
