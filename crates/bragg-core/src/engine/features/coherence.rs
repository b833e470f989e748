use super::{Feature, FeatureContext, FeatureUpdate};
use crate::core::fft::Fft3;
use crate::core::grid::{self, Shape3, crop_center, fftshift, shape_of};
use crate::core::io::ArrayFile;
use crate::engine::config::{CoherenceConfig, CoherenceKind};
use crate::engine::error::EngineError;
use ndarray::{Array3, Zip};
use std::path::Path;
use tracing::{debug, warn};

const INITIAL_KERNEL_SIGMA: f64 = 1.0;
const DIVISION_FLOOR: f64 = 1e-12;

/// Partial-coherence model.
///
/// The measured intensity is modeled as the coherent intensity convolved with a small kernel.
/// The kernel is refined by Richardson-Lucy deconvolution inside a window of the kernel's shape
/// centered on the zero frequency, comparing the measured intensity with the intensity of the
/// extrapolated amplitude `2·current − previous`.
pub struct PartialCoherence {
    kind: CoherenceKind,
    kernel: Array3<f64>,
    measured: Array3<f64>,
    previous: Option<Array3<f64>>,
    lucy_iterations: usize,
    normalize: bool,
    window_fft: Fft3,
}

impl PartialCoherence {
    /// Builds the model for origin-centered `data`, reusing `prior_dir/coherence.bin` when it
    /// holds a kernel of the right shape.
    pub fn new(
        config: &CoherenceConfig,
        data: &Array3<f64>,
        prior_dir: Option<&Path>,
    ) -> Result<Self, EngineError> {
        let full = shape_of(data);
        let mut window: Shape3 = [0; 3];
        for axis in 0..3 {
            window[axis] = config.kernel_shape[axis].min(full[axis]);
        }

        let kernel = match prior_dir.map(|dir| dir.join("coherence.bin")) {
            Some(path) if path.is_file() => {
                let loaded = Array3::<f64>::read_from_path(&path)?;
                if shape_of(&loaded) == window {
                    debug!(path = %path.display(), "Loaded coherence kernel.");
                    loaded
                } else {
                    warn!(
                        path = %path.display(),
                        "Stored coherence kernel has the wrong shape; starting from a Gaussian."
                    );
                    initial_kernel(window)
                }
            }
            _ => initial_kernel(window),
        };

        let intensity = data.mapv(|v| v * v);
        Ok(Self {
            kind: config.kind,
            kernel,
            measured: crop_center(&fftshift(&intensity), window),
            previous: None,
            lucy_iterations: config.lucy_iterations,
            normalize: config.normalize,
            window_fft: Fft3::new(window),
        })
    }

    pub fn kernel(&self) -> &Array3<f64> {
        &self.kernel
    }

    fn window(&self, amplitudes: &Array3<f64>) -> Array3<f64> {
        crop_center(&fftshift(amplitudes), shape_of(&self.kernel))
    }

    /// Remembers the amplitudes of the iteration preceding a kernel update.
    pub fn store_previous(&mut self, amplitudes: &Array3<f64>) {
        self.previous = Some(self.window(amplitudes));
    }

    /// Partially coherent amplitude: `sqrt(|A|² ⊛ kernel)`.
    pub fn convolve(&self, fft: &Fft3, amplitudes: &Array3<f64>) -> Array3<f64> {
        let intensity = amplitudes.mapv(|a| a * a);
        fft.convolve_centered(&intensity, &self.kernel)
            .mapv(|v| v.max(0.0).sqrt())
    }

    /// Refines the kernel from the current amplitudes.
    pub fn update(&mut self, amplitudes: &Array3<f64>) {
        let current = self.window(amplitudes);
        let combined = match &self.previous {
            Some(previous) => {
                let mut combined = current;
                Zip::from(&mut combined)
                    .and(previous)
                    .for_each(|c, &p| *c = (2.0 * *c - p).max(0.0));
                combined
            }
            None => current,
        };
        let mut model = combined.mapv(|a| a * a);
        if self.normalize {
            let model_total = model.sum();
            if model_total > 0.0 {
                let scale = self.measured.sum() / model_total;
                model.mapv_inplace(|v| v * scale);
            }
        }
        match self.kind {
            CoherenceKind::Lucy => self.lucy(&model),
        }
    }

    fn lucy(&mut self, model: &Array3<f64>) {
        for _ in 0..self.lucy_iterations {
            let blurred = self.window_fft.convolve_centered(model, &self.kernel);
            let mut relative = self.measured.clone();
            Zip::from(&mut relative)
                .and(&blurred)
                .for_each(|r, &b| *r = if b > DIVISION_FLOOR { *r / b } else { 0.0 });
            let correction = self.window_fft.correlate_centered(&relative, model);
            Zip::from(&mut self.kernel)
                .and(&correction)
                .for_each(|k, &c| *k = (*k * c).max(0.0));
            let total = self.kernel.sum();
            if total > 0.0 {
                self.kernel.mapv_inplace(|k| k / total);
            }
        }
    }
}

fn initial_kernel(shape: Shape3) -> Array3<f64> {
    let mut kernel = Array3::<f64>::zeros((shape[0], shape[1], shape[2]));
    kernel[[shape[0] / 2, shape[1] / 2, shape[2] / 2]] = 1.0;
    let blurred = grid::gaussian_filter(&kernel, [INITIAL_KERNEL_SIGMA; 3]);
    let total = blurred.sum();
    blurred.mapv(|v| v / total)
}

impl Feature for PartialCoherence {
    fn name(&self) -> &'static str {
        "partial_coherence"
    }

    fn apply_trigger(&mut self, context: &FeatureContext) -> FeatureUpdate {
        if let Some(amplitudes) = context.amplitudes {
            self.update(amplitudes);
        }
        FeatureUpdate::Internal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn peaked_data(shape: Shape3) -> Array3<f64> {
        let centered = Array3::from_shape_fn((shape[0], shape[1], shape[2]), |(i, j, k)| {
            let d = [i, j, k]
                .iter()
                .zip(shape.iter())
                .map(|(&x, &n)| (x as f64 - (n / 2) as f64).powi(2))
                .sum::<f64>();
            (-d / 4.0).exp()
        });
        grid::ifftshift(&centered)
    }

    fn config(kernel: [usize; 3]) -> CoherenceConfig {
        CoherenceConfig {
            kernel_shape: kernel,
            lucy_iterations: 5,
            ..CoherenceConfig::default()
        }
    }

    #[test]
    fn initial_kernel_is_normalized_and_centered() {
        let pc = PartialCoherence::new(&config([5, 5, 5]), &peaked_data([8, 8, 8]), None).unwrap();
        assert!((pc.kernel().sum() - 1.0).abs() < 1e-12);
        assert_eq!(grid::argmax(pc.kernel()), [2, 2, 2]);
    }

    #[test]
    fn kernel_window_is_clipped_to_data_shape() {
        let pc = PartialCoherence::new(&config([16, 16, 16]), &peaked_data([8, 6, 4]), None)
            .unwrap();
        assert_eq!(shape_of(pc.kernel()), [8, 6, 4]);
    }

    #[test]
    fn update_keeps_kernel_normalized_and_non_negative() {
        let data = peaked_data([8, 8, 8]);
        let mut pc = PartialCoherence::new(&config([5, 5, 5]), &data, None).unwrap();
        pc.store_previous(&data);
        pc.update(&data.mapv(|v| v * 0.9));
        assert!((pc.kernel().sum() - 1.0).abs() < 1e-9);
        assert!(pc.kernel().iter().all(|&k| k >= 0.0));
    }

    #[test]
    fn convolution_preserves_total_intensity() {
        let data = peaked_data([8, 8, 8]);
        let pc = PartialCoherence::new(&config([3, 3, 3]), &data, None).unwrap();
        let fft = Fft3::new([8, 8, 8]);
        let convolved = pc.convolve(&fft, &data);
        let before: f64 = data.iter().map(|a| a * a).sum();
        let after: f64 = convolved.iter().map(|a| a * a).sum();
        assert!((before - after).abs() < 1e-9 * before);
    }

    #[test]
    fn stored_kernel_is_reused_from_prior_directory() {
        let dir = tempdir().unwrap();
        let mut kernel = Array3::<f64>::zeros((3, 3, 3));
        kernel[[0, 1, 2]] = 1.0;
        kernel.write_to_path(dir.path().join("coherence.bin")).unwrap();
        let pc = PartialCoherence::new(&config([3, 3, 3]), &peaked_data([6, 6, 6]), Some(dir.path()))
            .unwrap();
        assert_eq!(pc.kernel(), &kernel);
    }
}
