//! Crossover of a population member with the generation's alpha.
//!
//! Before combining, the member is registered to the alpha: of the member and its twin
//! (conjugate, axis-reversed) the one whose magnitude overlaps the alpha best is kept, its
//! center of mass is moved onto the alpha's, and its global phase is rotated to match.

use super::error::EngineError;
use crate::core::fft::Fft3;
use crate::core::grid::{self, center_of_mass, conj_flip, magnitude, shape_of};
use ndarray::{Array3, Zip};
use num_complex::Complex64;
use rand::Rng;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreedMode {
    /// Member is kept as is.
    None,
    SqrtAb,
    SqrtAbPa,
    SqrtAbRecip,
    Dsqrt,
    PixelSwitch,
    BPa,
    TwoAbAB,
    TwoABPa,
    MaxAb,
    MaxAbPa,
    MinAbPa,
    AvgAb,
    AvgAbPa,
}

impl BreedMode {
    pub const ALL: [BreedMode; 14] = [
        BreedMode::None,
        BreedMode::SqrtAb,
        BreedMode::SqrtAbPa,
        BreedMode::SqrtAbRecip,
        BreedMode::Dsqrt,
        BreedMode::PixelSwitch,
        BreedMode::BPa,
        BreedMode::TwoAbAB,
        BreedMode::TwoABPa,
        BreedMode::MaxAb,
        BreedMode::MaxAbPa,
        BreedMode::MinAbPa,
        BreedMode::AvgAb,
        BreedMode::AvgAbPa,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BreedMode::None => "none",
            BreedMode::SqrtAb => "sqrt_ab",
            BreedMode::SqrtAbPa => "sqrt_ab_pa",
            BreedMode::SqrtAbRecip => "sqrt_ab_recip",
            BreedMode::Dsqrt => "dsqrt",
            BreedMode::PixelSwitch => "pixel_switch",
            BreedMode::BPa => "b_pa",
            BreedMode::TwoAbAB => "2ab_a_b",
            BreedMode::TwoABPa => "2a_b_pa",
            BreedMode::MaxAb => "max_ab",
            BreedMode::MaxAbPa => "max_ab_pa",
            BreedMode::MinAbPa => "min_ab_pa",
            BreedMode::AvgAb => "avg_ab",
            BreedMode::AvgAbPa => "avg_ab_pa",
        }
    }
}

impl fmt::Display for BreedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BreedMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BreedMode::ALL
            .into_iter()
            .find(|mode| mode.name() == s.trim())
            .ok_or_else(|| format!("unknown breed mode '{s}'"))
    }
}

/// Registers `image` to `alpha` (twin choice, center of mass, global phase).
pub fn align_to(alpha: &Array3<Complex64>, image: &Array3<Complex64>) -> Array3<Complex64> {
    let alpha_mag = magnitude(alpha);
    let target = center_of_mass(&alpha_mag);

    let recenter = |candidate: Array3<Complex64>| {
        let com = center_of_mass(&magnitude(&candidate));
        let mut shift = [0isize; 3];
        for axis in 0..3 {
            shift[axis] = (target[axis] - com[axis]).round() as isize;
        }
        grid::roll(&candidate, shift)
    };
    let overlap = |candidate: &Array3<Complex64>| -> f64 {
        alpha_mag
            .iter()
            .zip(candidate.iter())
            .map(|(a, c)| a * c.norm())
            .sum()
    };

    let direct = recenter(image.clone());
    let twin = recenter(conj_flip(image));
    let mut aligned = if overlap(&twin) > overlap(&direct) {
        twin
    } else {
        direct
    };

    let cross: Complex64 = aligned
        .iter()
        .zip(alpha.iter())
        .map(|(b, a)| b * a.conj())
        .sum();
    if cross.norm() > 0.0 {
        let rotation = Complex64::from_polar(1.0, -cross.arg());
        aligned.mapv_inplace(|c| c * rotation);
    }
    aligned
}

/// Combines the aligned member with the alpha according to `mode`.
pub fn breed(
    mode: BreedMode,
    alpha: &Array3<Complex64>,
    image: &Array3<Complex64>,
    fft: &Fft3,
    rng: &mut impl Rng,
) -> Result<Array3<Complex64>, EngineError> {
    let expected = shape_of(image);
    let found = shape_of(alpha);
    if expected != found {
        return Err(EngineError::Shape { expected, found });
    }
    if mode == BreedMode::None {
        return Ok(image.clone());
    }
    if !grid::is_finite(alpha) {
        return Err(EngineError::Breeding("alpha image is not finite".into()));
    }

    let beta = align_to(alpha, image);
    let mut child = Array3::<Complex64>::zeros(alpha.raw_dim());

    match mode {
        BreedMode::PixelSwitch => {
            Zip::from(&mut child)
                .and(alpha)
                .and(&beta)
                .for_each(|c, &a, &b| *c = if rng.r#gen::<f64>() > 0.5 { a } else { b });
        }
        BreedMode::SqrtAbRecip => {
            let mut a_hat = alpha.clone();
            let mut b_hat = beta;
            fft.forward(&mut a_hat);
            fft.forward(&mut b_hat);
            Zip::from(&mut child)
                .and(&a_hat)
                .and(&b_hat)
                .for_each(|c, &a, &b| *c = mean_phase_product(a, b));
            fft.inverse(&mut child);
        }
        _ => {
            Zip::from(&mut child)
                .and(alpha)
                .and(&beta)
                .for_each(|c, &a, &b| *c = combine(mode, a, b));
        }
    }

    if !grid::is_finite(&child) {
        return Err(EngineError::Breeding(format!(
            "mode '{mode}' produced a non-finite image"
        )));
    }
    Ok(child)
}

/// `sqrt(|a||b|)` with the mean of both phases.
fn mean_phase_product(a: Complex64, b: Complex64) -> Complex64 {
    Complex64::from_polar((a.norm() * b.norm()).sqrt(), 0.5 * (a.arg() + b.arg()))
}

fn combine(mode: BreedMode, a: Complex64, b: Complex64) -> Complex64 {
    let with_alpha_phase = |amplitude: f64| Complex64::from_polar(amplitude, a.arg());
    match mode {
        BreedMode::SqrtAb => (a * b).sqrt(),
        BreedMode::SqrtAbPa => with_alpha_phase((a.norm() * b.norm()).sqrt()),
        BreedMode::Dsqrt => Complex64::from_polar(b.norm().sqrt(), b.arg()),
        BreedMode::BPa => with_alpha_phase(b.norm()),
        BreedMode::TwoAbAB => {
            let sum = a + b;
            if sum.norm() == 0.0 {
                Complex64::new(0.0, 0.0)
            } else {
                2.0 * a * b / sum
            }
        }
        BreedMode::TwoABPa => with_alpha_phase((2.0 * a.norm() - b.norm()).max(0.0)),
        BreedMode::MaxAb => {
            Complex64::from_polar(a.norm().max(b.norm()), 0.5 * (a.arg() + b.arg()))
        }
        BreedMode::MaxAbPa => with_alpha_phase(a.norm().max(b.norm())),
        BreedMode::MinAbPa => with_alpha_phase(a.norm().min(b.norm())),
        BreedMode::AvgAb => 0.5 * (a + b),
        BreedMode::AvgAbPa => with_alpha_phase(0.5 * (a.norm() + b.norm())),
        BreedMode::None | BreedMode::PixelSwitch | BreedMode::SqrtAbRecip => b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn blob(center: [usize; 3], phase: f64) -> Array3<Complex64> {
        Array3::from_shape_fn((8, 8, 8), |(i, j, k)| {
            let d = [i, j, k]
                .iter()
                .zip(center.iter())
                .map(|(&x, &c)| (x as f64 - c as f64).powi(2))
                .sum::<f64>();
            Complex64::from_polar((-d / 2.0).exp(), phase)
        })
    }

    #[test]
    fn mode_names_round_trip_through_from_str() {
        for mode in BreedMode::ALL {
            assert_eq!(mode.name().parse::<BreedMode>().unwrap(), mode);
        }
        assert!("sqrt".parse::<BreedMode>().is_err());
    }

    #[test]
    fn alignment_recenters_and_removes_global_phase() {
        let alpha = blob([4, 4, 4], 0.0);
        let shifted = blob([2, 3, 5], 1.2);
        let aligned = align_to(&alpha, &shifted);
        assert_eq!(grid::argmax(&magnitude(&aligned)), [4, 4, 4]);
        assert!(aligned[[4, 4, 4]].arg().abs() < 1e-9);
    }

    #[test]
    fn breeding_identical_members_is_a_fixed_point_for_averaging_modes() {
        let alpha = blob([4, 4, 4], 0.3);
        let fft = Fft3::new([8, 8, 8]);
        let mut rng = StdRng::seed_from_u64(3);
        for mode in [
            BreedMode::SqrtAbPa,
            BreedMode::AvgAb,
            BreedMode::MaxAbPa,
            BreedMode::MinAbPa,
            BreedMode::PixelSwitch,
            BreedMode::BPa,
        ] {
            let child = breed(mode, &alpha, &alpha, &fft, &mut rng).unwrap();
            Zip::from(&child).and(&alpha).for_each(|c, a| {
                assert!((c - a).norm() < 1e-9, "{mode} changed an identical member");
            });
        }
    }

    #[test]
    fn harmonic_mode_is_zero_where_members_cancel() {
        let a = Complex64::new(1.0, 0.0);
        assert_eq!(combine(BreedMode::TwoAbAB, a, -a), Complex64::new(0.0, 0.0));
        assert!((combine(BreedMode::TwoAbAB, a, a) - a).norm() < 1e-12);
    }

    #[test]
    fn shape_mismatch_is_reported() {
        let alpha = Array3::<Complex64>::zeros((4, 4, 4));
        let image = Array3::<Complex64>::zeros((4, 4, 2));
        let fft = Fft3::new([4, 4, 2]);
        let mut rng = StdRng::seed_from_u64(0);
        let result = breed(BreedMode::AvgAb, &alpha, &image, &fft, &mut rng);
        assert!(matches!(result, Err(EngineError::Shape { .. })));
    }

    #[test]
    fn none_mode_returns_member_unchanged() {
        let alpha = blob([4, 4, 4], 0.0);
        let image = blob([3, 3, 3], 0.5);
        let fft = Fft3::new([8, 8, 8]);
        let mut rng = StdRng::seed_from_u64(0);
        let child = breed(BreedMode::None, &alpha, &image, &fft, &mut rng).unwrap();
        assert_eq!(child, image);
    }
}
