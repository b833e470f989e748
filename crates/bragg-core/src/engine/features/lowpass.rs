use super::{Feature, FeatureContext, FeatureUpdate};
use crate::core::grid::{self, shape_of};
use crate::engine::config::LowPassConfig;
use ndarray::Array3;

/// Progressive-resolution filter.
///
/// Between `start` and `stop` the modulus projection sees the data multiplied by a Gaussian
/// envelope centered on the zero frequency. The envelope's width, a fraction of the half extent
/// of each axis, grows linearly from `range[0]` to `range[1]`; a width of one or more leaves the
/// data untouched. The support is re-derived at a matching resolution.
#[derive(Debug, Clone)]
pub struct LowPassFilter {
    start: usize,
    stop: usize,
    range: [f64; 2],
    sw_threshold: f64,
}

impl LowPassFilter {
    pub fn new(config: &LowPassConfig, start: usize, stop: usize) -> Self {
        Self {
            start,
            stop,
            range: config.range,
            sw_threshold: config.sw_threshold,
        }
    }

    pub fn width_at(&self, iteration: usize) -> f64 {
        if self.stop <= self.start {
            return self.range[1];
        }
        let progress = (iteration.clamp(self.start, self.stop) - self.start) as f64
            / (self.stop - self.start) as f64;
        self.range[0] + (self.range[1] - self.range[0]) * progress
    }
}

fn signed_frequency(index: usize, extent: usize) -> f64 {
    if index <= extent / 2 {
        index as f64
    } else {
        index as f64 - extent as f64
    }
}

/// Multiplies origin-centered data by a Gaussian envelope of the given width fraction.
pub fn envelope(data: &Array3<f64>, width: f64) -> Array3<f64> {
    if width >= 1.0 {
        return data.clone();
    }
    let shape = shape_of(data);
    let sigmas = shape.map(|n| (width * n as f64 / 2.0).max(f64::EPSILON));
    let mut filtered = data.clone();
    for ((i, j, k), value) in filtered.indexed_iter_mut() {
        let q = [
            signed_frequency(i, shape[0]) / sigmas[0],
            signed_frequency(j, shape[1]) / sigmas[1],
            signed_frequency(k, shape[2]) / sigmas[2],
        ];
        *value *= (-(q[0] * q[0] + q[1] * q[1] + q[2] * q[2]) / 2.0).exp();
    }
    filtered
}

impl Feature for LowPassFilter {
    fn name(&self) -> &'static str {
        "lowpass_filter"
    }

    fn apply_trigger(&mut self, context: &FeatureContext) -> FeatureUpdate {
        let width = self.width_at(context.iteration);
        FeatureUpdate::Resolution {
            data: envelope(context.data, width),
            support: grid::shrink_wrap(context.image, self.sw_threshold, 1.0 / width),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::config::Trigger;

    fn filter(range: [f64; 2]) -> LowPassFilter {
        let config = LowPassConfig {
            trigger: Trigger::Bounded {
                start: 10,
                step: 1,
                stop: 20,
            },
            range,
            sw_threshold: 0.1,
        };
        LowPassFilter::new(&config, 10, 20)
    }

    #[test]
    fn width_grows_linearly_over_the_range() {
        let lpf = filter([0.2, 0.8]);
        assert!((lpf.width_at(10) - 0.2).abs() < 1e-12);
        assert!((lpf.width_at(15) - 0.5).abs() < 1e-12);
        assert!((lpf.width_at(20) - 0.8).abs() < 1e-12);
    }

    #[test]
    fn envelope_keeps_zero_frequency_and_damps_high_frequencies() {
        let data = Array3::<f64>::ones((8, 8, 8));
        let filtered = envelope(&data, 0.3);
        assert_eq!(filtered[[0, 0, 0]], 1.0);
        assert!(filtered[[4, 4, 4]] < 0.01);
        assert!((filtered[[1, 0, 0]] - filtered[[7, 0, 0]]).abs() < 1e-12);
    }

    #[test]
    fn full_width_leaves_data_untouched() {
        let data = Array3::from_shape_fn((4, 4, 4), |(i, j, k)| (i + j + k) as f64);
        assert_eq!(envelope(&data, 1.0), data);
    }
}
