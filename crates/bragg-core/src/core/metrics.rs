use super::grid::shrink_wrap;
use ndarray::Array3;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const TIGHT_SUPPORT_THRESHOLD: f64 = 0.2;
const TIGHT_SUPPORT_SIGMA: f64 = 0.5;

/// The scalar quantity a genetic-algorithm generation ranks its members by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    /// Final modulus residual.
    Chi,
    /// Sum of the fourth power of the image magnitude.
    Sharpness,
    /// Summed absolute phase deviation over the tight support.
    SummedPhase,
    /// Number of voxels in the tight support.
    Area,
}

impl MetricType {
    pub fn higher_is_better(self) -> bool {
        matches!(self, MetricType::SummedPhase | MetricType::Area)
    }

    /// Whether `candidate` ranks strictly ahead of `incumbent` under this metric.
    pub fn is_better(self, candidate: f64, incumbent: f64) -> bool {
        if self.higher_is_better() {
            candidate > incumbent
        } else {
            candidate < incumbent
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MetricType::Chi => "chi",
            MetricType::Sharpness => "sharpness",
            MetricType::SummedPhase => "summed_phase",
            MetricType::Area => "area",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MetricType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chi" => Ok(MetricType::Chi),
            "sharpness" => Ok(MetricType::Sharpness),
            "summed_phase" => Ok(MetricType::SummedPhase),
            "area" => Ok(MetricType::Area),
            other => Err(format!("unknown metric type '{other}'")),
        }
    }
}

/// All fitness quantities of one reconstruction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub chi: f64,
    pub sharpness: f64,
    pub summed_phase: f64,
    pub area: f64,
}

impl Metric {
    /// Derives every metric from the image and its modulus-error history.
    ///
    /// The tight support used for `summed_phase` and `area` is a shrink-wrap of the image at a
    /// fixed threshold of 0.2 and sigma of 0.5, independent of the reconstruction's own
    /// shrink-wrap settings.
    pub fn compute(image: &Array3<Complex64>, errors: &[f64]) -> Self {
        let chi = errors.last().copied().unwrap_or(f64::INFINITY);
        let sharpness = image.iter().map(|c| c.norm_sqr().powi(2)).sum();

        let tight = shrink_wrap(image, TIGHT_SUPPORT_THRESHOLD, TIGHT_SUPPORT_SIGMA);
        let phases: Vec<f64> = image
            .iter()
            .zip(tight.iter())
            .filter(|(_, inside)| **inside)
            .map(|(c, _)| c.arg())
            .collect();
        let area = phases.len() as f64;
        let summed_phase = if phases.is_empty() {
            0.0
        } else {
            let mean = phases.iter().sum::<f64>() / area;
            phases.iter().map(|p| (p - mean).abs()).sum()
        };

        Self {
            chi,
            sharpness,
            summed_phase,
            area,
        }
    }

    pub fn get(&self, metric_type: MetricType) -> f64 {
        match metric_type {
            MetricType::Chi => self.chi,
            MetricType::Sharpness => self.sharpness,
            MetricType::SummedPhase => self.summed_phase,
            MetricType::Area => self.area,
        }
    }
}
