use super::grid::{Shape3, ifftshift, pad_center, shape_of, voxel_count};
use ndarray::{Array3, ArrayViewMut1, Axis, Zip};
use num_complex::Complex64;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

/// A planned three-dimensional complex FFT for one fixed volume shape.
///
/// The transform is applied axis by axis, each axis as a batch of independent 1D lanes. The
/// forward direction is unnormalized; the inverse direction scales by `1 / N`.
#[derive(Clone)]
pub struct Fft3 {
    shape: Shape3,
    forward: [Arc<dyn Fft<f64>>; 3],
    inverse: [Arc<dyn Fft<f64>>; 3],
}

impl std::fmt::Debug for Fft3 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fft3").field("shape", &self.shape).finish()
    }
}

impl Fft3 {
    pub fn new(shape: Shape3) -> Self {
        let mut planner = FftPlanner::<f64>::new();
        let forward = shape.map(|n| planner.plan_fft_forward(n));
        let inverse = shape.map(|n| planner.plan_fft_inverse(n));
        Self {
            shape,
            forward,
            inverse,
        }
    }

    pub fn shape(&self) -> Shape3 {
        self.shape
    }

    pub fn forward(&self, data: &mut Array3<Complex64>) {
        debug_assert_eq!(shape_of(data), self.shape);
        for (axis, plan) in self.forward.iter().enumerate() {
            transform_axis(data, axis, plan);
        }
    }

    pub fn inverse(&self, data: &mut Array3<Complex64>) {
        debug_assert_eq!(shape_of(data), self.shape);
        for (axis, plan) in self.inverse.iter().enumerate() {
            transform_axis(data, axis, plan);
        }
        let scale = 1.0 / voxel_count(self.shape) as f64;
        data.mapv_inplace(|c| c * scale);
    }

    /// Circular convolution of a real volume with a centered kernel of any smaller shape.
    pub fn convolve_centered(&self, data: &Array3<f64>, kernel: &Array3<f64>) -> Array3<f64> {
        let mut spectrum = data.mapv(|v| Complex64::new(v, 0.0));
        let mut response = ifftshift(&pad_center(kernel, self.shape)).mapv(|v| Complex64::new(v, 0.0));
        self.forward(&mut spectrum);
        self.forward(&mut response);
        Zip::from(&mut spectrum)
            .and(&response)
            .for_each(|s, &r| *s *= r);
        self.inverse(&mut spectrum);
        spectrum.mapv(|c| c.re)
    }

    /// Circular cross-correlation of two real volumes of this shape, with zero lag mapped to
    /// the volume center.
    pub fn correlate_centered(&self, a: &Array3<f64>, b: &Array3<f64>) -> Array3<f64> {
        let mut spectrum = a.mapv(|v| Complex64::new(v, 0.0));
        let mut other = b.mapv(|v| Complex64::new(v, 0.0));
        self.forward(&mut spectrum);
        self.forward(&mut other);
        Zip::from(&mut spectrum)
            .and(&other)
            .for_each(|s, &o| *s *= o.conj());
        self.inverse(&mut spectrum);
        super::grid::fftshift(&spectrum.mapv(|c| c.re))
    }
}

fn transform_lane(mut lane: ArrayViewMut1<Complex64>, plan: &Arc<dyn Fft<f64>>) {
    let mut buffer: Vec<Complex64> = lane.iter().copied().collect();
    let mut scratch = vec![Complex64::default(); plan.get_inplace_scratch_len()];
    plan.process_with_scratch(&mut buffer, &mut scratch);
    for (dst, src) in lane.iter_mut().zip(buffer) {
        *dst = src;
    }
}

fn transform_axis(data: &mut Array3<Complex64>, axis: usize, plan: &Arc<dyn Fft<f64>>) {
    if plan.len() <= 1 {
        return;
    }
    let zip = Zip::from(data.lanes_mut(Axis(axis)));

    #[cfg(not(feature = "parallel"))]
    zip.for_each(|lane| transform_lane(lane, plan));

    #[cfg(feature = "parallel")]
    zip.par_for_each(|lane| transform_lane(lane, plan));
}
