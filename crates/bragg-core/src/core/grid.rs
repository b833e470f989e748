use ndarray::{Array3, ArrayView1, ArrayViewMut1, Axis, Zip, s};
use num_complex::Complex64;

/// Extent of a volume along its three axes.
pub type Shape3 = [usize; 3];

const GAUSSIAN_TRUNCATE: f64 = 4.0;

pub fn shape_of<T>(array: &Array3<T>) -> Shape3 {
    let (n0, n1, n2) = array.dim();
    [n0, n1, n2]
}

pub fn voxel_count(shape: Shape3) -> usize {
    shape.iter().product()
}

/// Index of the largest value. Ties resolve to the first index in logical order.
pub fn argmax(array: &Array3<f64>) -> Shape3 {
    let mut best = [0; 3];
    let mut best_value = f64::NEG_INFINITY;
    for ((i, j, k), &value) in array.indexed_iter() {
        if value > best_value {
            best_value = value;
            best = [i, j, k];
        }
    }
    best
}

/// Circular shift: the element at index `x` moves to `x + shift` (modulo the extent).
pub fn roll<T: Clone>(array: &Array3<T>, shift: [isize; 3]) -> Array3<T> {
    if array.is_empty() {
        return array.clone();
    }
    let [n0, n1, n2] = shape_of(array);
    Array3::from_shape_fn((n0, n1, n2), |(i, j, k)| {
        array[[
            wrap(i as isize - shift[0], n0),
            wrap(j as isize - shift[1], n1),
            wrap(k as isize - shift[2], n2),
        ]]
        .clone()
    })
}

fn wrap(index: isize, extent: usize) -> usize {
    index.rem_euclid(extent as isize) as usize
}

/// Rolls the volume so that its largest value lands on index `[0, 0, 0]`.
pub fn origin_shift(data: &Array3<f64>) -> Array3<f64> {
    let peak = argmax(data);
    roll(data, peak.map(|p| -(p as isize)))
}

/// Moves index `[0, 0, 0]` to the center of the volume.
pub fn fftshift<T: Clone>(array: &Array3<T>) -> Array3<T> {
    let shape = shape_of(array);
    roll(array, shape.map(|n| (n / 2) as isize))
}

/// Inverse of [`fftshift`], also for odd extents.
pub fn ifftshift<T: Clone>(array: &Array3<T>) -> Array3<T> {
    let shape = shape_of(array);
    roll(array, shape.map(|n| -((n / 2) as isize)))
}

/// Intensity-weighted center of the volume. An all-zero volume reports its geometric center.
pub fn center_of_mass(weights: &Array3<f64>) -> [f64; 3] {
    let mut total = 0.0;
    let mut moment = [0.0; 3];
    for ((i, j, k), &w) in weights.indexed_iter() {
        total += w;
        moment[0] += w * i as f64;
        moment[1] += w * j as f64;
        moment[2] += w * k as f64;
    }
    if total <= 0.0 {
        return shape_of(weights).map(|n| n as f64 / 2.0);
    }
    moment.map(|m| m / total)
}

/// Shift that carries `point` onto the volume center.
pub fn shift_to_center(point: [f64; 3], shape: Shape3) -> [isize; 3] {
    let mut shift = [0; 3];
    for axis in 0..3 {
        shift[axis] = (shape[axis] as f64 / 2.0 - point[axis]).round() as isize;
    }
    shift
}

/// Centers the image on the center of mass of its magnitude, rolling the support by the same
/// amount so the pair stays registered.
pub fn center_sync(
    image: &Array3<Complex64>,
    support: &Array3<bool>,
) -> (Array3<Complex64>, Array3<bool>) {
    let com = center_of_mass(&magnitude(image));
    let shift = shift_to_center(com, shape_of(image));
    (roll(image, shift), roll(support, shift))
}

pub fn magnitude(image: &Array3<Complex64>) -> Array3<f64> {
    image.mapv(|c| c.norm())
}

pub fn norm(array: &Array3<Complex64>) -> f64 {
    array.iter().map(|c| c.norm_sqr()).sum::<f64>().sqrt()
}

pub fn norm_real(array: &Array3<f64>) -> f64 {
    array.iter().map(|v| v * v).sum::<f64>().sqrt()
}

pub fn max_magnitude(image: &Array3<Complex64>) -> f64 {
    image.iter().fold(0.0_f64, |acc, c| acc.max(c.norm()))
}

pub fn is_finite(image: &Array3<Complex64>) -> bool {
    image.iter().all(|c| c.re.is_finite() && c.im.is_finite())
}

/// Boolean box centered in a volume of `shape`, spanning `fractions` of each extent.
pub fn centered_box(shape: Shape3, fractions: [f64; 3]) -> Array3<bool> {
    let mut ranges = [(0, 0); 3];
    for axis in 0..3 {
        let n = shape[axis];
        let width = ((n as f64 * fractions[axis]).round() as usize).clamp(1, n.max(1));
        let start = (n - width.min(n)) / 2;
        ranges[axis] = (start, start + width);
    }
    Array3::from_shape_fn((shape[0], shape[1], shape[2]), |(i, j, k)| {
        (ranges[0].0..ranges[0].1).contains(&i)
            && (ranges[1].0..ranges[1].1).contains(&j)
            && (ranges[2].0..ranges[2].1).contains(&k)
    })
}

/// Sub-volume of `shape` whose center index coincides with the center index of `array`.
/// Axes already smaller than the request are kept whole.
pub fn crop_center<T: Clone>(array: &Array3<T>, shape: Shape3) -> Array3<T> {
    let full = shape_of(array);
    let mut start = [0; 3];
    let mut end = [0; 3];
    for axis in 0..3 {
        let width = shape[axis].min(full[axis]);
        start[axis] = full[axis] / 2 - width / 2;
        end[axis] = start[axis] + width;
    }
    array
        .slice(s![start[0]..end[0], start[1]..end[1], start[2]..end[2]])
        .to_owned()
}

/// Embeds `array` in the middle of a default-filled volume of `shape`.
pub fn pad_center<T: Clone + Default>(array: &Array3<T>, shape: Shape3) -> Array3<T> {
    let inner = crop_center(array, shape);
    let inner_shape = shape_of(&inner);
    let mut out = Array3::from_elem((shape[0], shape[1], shape[2]), T::default());
    let start: Vec<usize> = (0..3).map(|a| shape[a] / 2 - inner_shape[a] / 2).collect();
    out.slice_mut(s![
        start[0]..start[0] + inner_shape[0],
        start[1]..start[1] + inner_shape[1],
        start[2]..start[2] + inner_shape[2]
    ])
    .assign(&inner);
    out
}

/// Complex conjugate of the volume reversed along every axis (the twin image).
pub fn conj_flip(image: &Array3<Complex64>) -> Array3<Complex64> {
    image.slice(s![..;-1, ..;-1, ..;-1]).mapv(|c| c.conj())
}

fn gaussian_kernel(sigma: f64) -> Vec<f64> {
    let radius = (GAUSSIAN_TRUNCATE * sigma + 0.5) as isize;
    let weights: Vec<f64> = (-radius..=radius)
        .map(|x| (-(x * x) as f64 / (2.0 * sigma * sigma)).exp())
        .collect();
    let total: f64 = weights.iter().sum();
    weights.into_iter().map(|w| w / total).collect()
}

fn reflect(index: isize, extent: isize) -> usize {
    if extent == 1 {
        return 0;
    }
    let period = 2 * extent;
    let folded = index.rem_euclid(period);
    if folded >= extent {
        (period - 1 - folded) as usize
    } else {
        folded as usize
    }
}

fn convolve_lane(src: ArrayView1<f64>, mut dst: ArrayViewMut1<f64>, kernel: &[f64]) {
    let n = src.len() as isize;
    let radius = (kernel.len() / 2) as isize;
    for i in 0..n {
        let mut acc = 0.0;
        for (offset, weight) in kernel.iter().enumerate() {
            acc += weight * src[reflect(i + offset as isize - radius, n)];
        }
        dst[i as usize] = acc;
    }
}

/// Separable Gaussian smoothing with mirrored (`d c b a | a b c d | d c b a`) boundaries.
/// Axes with a non-positive sigma are left untouched.
pub fn gaussian_filter(array: &Array3<f64>, sigmas: [f64; 3]) -> Array3<f64> {
    let mut current = array.clone();
    for (axis, &sigma) in sigmas.iter().enumerate() {
        if sigma <= 0.0 || !sigma.is_finite() {
            continue;
        }
        let kernel = gaussian_kernel(sigma);
        let mut filtered = Array3::<f64>::zeros(current.raw_dim());
        let zip = Zip::from(current.lanes(Axis(axis))).and(filtered.lanes_mut(Axis(axis)));

        #[cfg(not(feature = "parallel"))]
        zip.for_each(|src, dst| convolve_lane(src, dst, &kernel));

        #[cfg(feature = "parallel")]
        zip.par_for_each(|src, dst| convolve_lane(src, dst, &kernel));

        current = filtered;
    }
    current
}

/// Gaussian smoothing of a volume whose peak sits at the origin, treating it as periodic.
pub fn gaussian_filter_centered(data: &Array3<f64>, sigma: f64) -> Array3<f64> {
    ifftshift(&gaussian_filter(&fftshift(data), [sigma; 3]))
}

/// Support estimate: voxels where the Gaussian-smoothed magnitude reaches `threshold` of its
/// maximum.
pub fn shrink_wrap(image: &Array3<Complex64>, threshold: f64, sigma: f64) -> Array3<bool> {
    let blurred = gaussian_filter(&magnitude(image), [sigma; 3]);
    let peak = blurred.iter().fold(0.0_f64, |acc, &v| acc.max(v));
    let cutoff = threshold * peak;
    blurred.mapv(|v| peak > 0.0 && v >= cutoff)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(shape: Shape3) -> Array3<f64> {
        Array3::from_shape_fn((shape[0], shape[1], shape[2]), |(i, j, k)| {
            (i * 100 + j * 10 + k) as f64
        })
    }

    #[test]
    fn roll_moves_elements_forward_with_wraparound() {
        let a = ramp([4, 3, 2]);
        let rolled = roll(&a, [1, -1, 0]);
        assert_eq!(rolled[[1, 0, 0]], a[[0, 1, 0]]);
        assert_eq!(rolled[[0, 2, 1]], a[[3, 0, 1]]);
    }

    #[test]
    fn fftshift_and_ifftshift_are_inverse_for_odd_extents() {
        let a = ramp([5, 4, 3]);
        assert_eq!(ifftshift(&fftshift(&a)), a);
    }

    #[test]
    fn origin_shift_moves_peak_to_origin() {
        let mut data = Array3::<f64>::zeros((6, 6, 6));
        data[[3, 4, 1]] = 10.0;
        data[[3, 4, 2]] = 5.0;
        let shifted = origin_shift(&data);
        assert_eq!(shifted[[0, 0, 0]], 10.0);
        assert_eq!(shifted[[0, 0, 1]], 5.0);
    }

    #[test]
    fn center_of_mass_of_single_voxel_is_its_index() {
        let mut a = Array3::<f64>::zeros((5, 5, 5));
        a[[1, 2, 3]] = 2.0;
        assert_eq!(center_of_mass(&a), [1.0, 2.0, 3.0]);
    }

    #[test]
    fn center_sync_keeps_image_and_support_registered() {
        let mut image = Array3::<Complex64>::zeros((8, 8, 8));
        let mut support = Array3::from_elem((8, 8, 8), false);
        image[[1, 1, 1]] = Complex64::new(1.0, 0.0);
        support[[1, 1, 1]] = true;
        let (image, support) = center_sync(&image, &support);
        assert_eq!(image[[4, 4, 4]], Complex64::new(1.0, 0.0));
        assert!(support[[4, 4, 4]]);
        assert_eq!(support.iter().filter(|&&v| v).count(), 1);
    }

    #[test]
    fn gaussian_filter_preserves_total_of_interior_mass() {
        let mut a = Array3::<f64>::zeros((16, 16, 16));
        a[[8, 8, 8]] = 1.0;
        let filtered = gaussian_filter(&a, [1.0; 3]);
        let total: f64 = filtered.sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!(filtered[[8, 8, 8]] > filtered[[9, 8, 8]]);
        assert!((filtered[[9, 8, 8]] - filtered[[7, 8, 8]]).abs() < 1e-12);
    }

    #[test]
    fn gaussian_filter_with_zero_sigma_is_identity() {
        let a = ramp([3, 3, 3]);
        assert_eq!(gaussian_filter(&a, [0.0; 3]), a);
    }

    #[test]
    fn centered_box_has_expected_extent() {
        let b = centered_box([10, 10, 10], [0.4, 0.5, 1.0]);
        assert_eq!(b.iter().filter(|&&v| v).count(), 4 * 5 * 10);
        assert!(b[[5, 5, 0]]);
        assert!(!b[[0, 5, 5]]);
    }

    #[test]
    fn pad_then_crop_recovers_the_original() {
        let a = ramp([3, 4, 5]);
        let padded = pad_center(&a, [7, 8, 9]);
        assert_eq!(shape_of(&padded), [7, 8, 9]);
        assert_eq!(crop_center(&padded, [3, 4, 5]), a);
    }

    #[test]
    fn shrink_wrap_selects_bright_region() {
        let mut image = Array3::<Complex64>::zeros((12, 12, 12));
        for i in 4..8 {
            for j in 4..8 {
                for k in 4..8 {
                    image[[i, j, k]] = Complex64::new(1.0, 0.0);
                }
            }
        }
        let support = shrink_wrap(&image, 0.5, 0.5);
        assert!(support[[5, 5, 5]]);
        assert!(!support[[0, 0, 0]]);
    }

    #[test]
    fn shrink_wrap_of_empty_image_is_empty() {
        let image = Array3::<Complex64>::zeros((4, 4, 4));
        assert!(shrink_wrap(&image, 0.1, 1.0).iter().all(|&v| !v));
    }

    #[test]
    fn conj_flip_reverses_and_conjugates() {
        let mut image = Array3::<Complex64>::zeros((3, 3, 3));
        image[[0, 1, 2]] = Complex64::new(1.0, 2.0);
        let twin = conj_flip(&image);
        assert_eq!(twin[[2, 1, 0]], Complex64::new(1.0, -2.0));
    }
}
