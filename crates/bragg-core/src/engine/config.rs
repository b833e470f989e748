use super::breeding::BreedMode;
use crate::core::metrics::MetricType;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Clone)]
pub enum ConfigError {
    #[error("Missing required parameter: {0}")]
    MissingParameter(&'static str),

    #[error("Invalid value for '{name}': {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("Malformed algorithm sequence at position {position}: {reason}")]
    AlgorithmSyntax { position: usize, reason: String },

    #[error("Invalid trigger for '{feature}': {reason}")]
    InvalidTrigger { feature: &'static str, reason: String },

    #[error("Trigger for '{feature}' references iteration {iteration}, outside [0, {total})")]
    TriggerOutOfRange {
        feature: &'static str,
        iteration: i64,
        total: usize,
    },
}

/// When an optional operation fires. Negative iterations count back from the end of the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// `[at]`
    Once { at: i64 },
    /// `[start, step]`
    Periodic { start: i64, step: i64 },
    /// `[start, step, stop]`, with `stop` inclusive.
    Bounded { start: i64, step: i64, stop: i64 },
}

impl Trigger {
    pub fn from_values(feature: &'static str, values: &[i64]) -> Result<Self, ConfigError> {
        match *values {
            [at] => Ok(Trigger::Once { at }),
            [start, step] => Ok(Trigger::Periodic { start, step }),
            [start, step, stop] => Ok(Trigger::Bounded { start, step, stop }),
            _ => Err(ConfigError::InvalidTrigger {
                feature,
                reason: format!("expected 1 to 3 values, found {}", values.len()),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShrinkWrapKind {
    #[default]
    Gauss,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShrinkWrapConfig {
    pub triggers: Vec<Trigger>,
    pub kind: ShrinkWrapKind,
    pub threshold: f64,
    pub sigma: f64,
}

impl Default for ShrinkWrapConfig {
    fn default() -> Self {
        Self {
            triggers: vec![Trigger::Periodic { start: 1, step: 1 }],
            kind: ShrinkWrapKind::Gauss,
            threshold: 0.1,
            sigma: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhaseConstraintConfig {
    pub triggers: Vec<Trigger>,
    pub phase_min: f64,
    pub phase_max: f64,
}

impl Default for PhaseConstraintConfig {
    fn default() -> Self {
        Self {
            triggers: vec![Trigger::Bounded {
                start: 0,
                step: 1,
                stop: 320,
            }],
            phase_min: -1.57,
            phase_max: 1.57,
        }
    }
}

/// Progressive resolution: over a bounded range of iterations the data is low-pass filtered with
/// an envelope whose width grows linearly between the two `range` fractions.
#[derive(Debug, Clone, PartialEq)]
pub struct LowPassConfig {
    pub trigger: Trigger,
    pub range: [f64; 2],
    pub sw_threshold: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TwinConfig {
    pub triggers: Vec<Trigger>,
    /// Half kept along axes 0 and 1: `0` keeps the lower half, `1` the upper.
    pub halves: [usize; 2],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoherenceKind {
    #[default]
    Lucy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoherenceConfig {
    pub interval: usize,
    pub kind: CoherenceKind,
    pub lucy_iterations: usize,
    pub normalize: bool,
    pub kernel_shape: [usize; 3],
}

impl Default for CoherenceConfig {
    fn default() -> Self {
        Self {
            interval: 50,
            kind: CoherenceKind::Lucy,
            lucy_iterations: 20,
            normalize: true,
            kernel_shape: [16, 16, 16],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GaConfig {
    pub generations: usize,
    pub metrics: Vec<MetricType>,
    pub breed_modes: Vec<BreedMode>,
    /// Surviving member count after each generation. Missing entries repeat the last value.
    pub cullings: Vec<usize>,
    pub sw_thresholds: Vec<f64>,
    pub sw_gauss_sigmas: Vec<f64>,
    /// One Gaussian sigma per low-resolution generation, applied to the data.
    pub lowpass_sigmas: Vec<f64>,
    /// First generation that runs `.pc` steps with partial coherence.
    pub pc_start_generation: usize,
    /// Message-passing population (one member per device slot) instead of generation directories.
    pub fast: bool,
}

impl Default for GaConfig {
    fn default() -> Self {
        Self {
            generations: 2,
            metrics: vec![MetricType::Chi],
            breed_modes: vec![BreedMode::SqrtAb],
            cullings: Vec::new(),
            sw_thresholds: vec![0.1],
            sw_gauss_sigmas: vec![1.0],
            lowpass_sigmas: Vec::new(),
            pc_start_generation: 3,
            fast: true,
        }
    }
}

fn per_generation<T: Copy>(values: &[T], generation: usize) -> Option<T> {
    match values {
        [] => None,
        [single] => Some(*single),
        _ => values.get(generation).copied(),
    }
}

impl GaConfig {
    pub fn metric(&self, generation: usize) -> MetricType {
        per_generation(&self.metrics, generation).unwrap_or(MetricType::Chi)
    }

    pub fn breed_mode(&self, generation: usize) -> BreedMode {
        per_generation(&self.breed_modes, generation).unwrap_or(BreedMode::SqrtAb)
    }

    pub fn survivors(&self, generation: usize) -> usize {
        self.cullings
            .get(generation)
            .or(self.cullings.last())
            .copied()
            .unwrap_or(usize::MAX)
    }

    pub fn sw_threshold(&self, generation: usize) -> Option<f64> {
        per_generation(&self.sw_thresholds, generation)
    }

    pub fn sw_gauss_sigma(&self, generation: usize) -> Option<f64> {
        per_generation(&self.sw_gauss_sigmas, generation)
    }

    pub fn lowpass_sigma(&self, generation: usize) -> Option<f64> {
        self.lowpass_sigmas.get(generation).copied()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.generations < 2 {
            return Err(ConfigError::InvalidParameter {
                name: "ga_generations",
                reason: format!("at least 2 generations required, found {}", self.generations),
            });
        }
        if self.cullings.len() > self.generations {
            return Err(ConfigError::InvalidParameter {
                name: "ga_cullings",
                reason: "more entries than generations".into(),
            });
        }
        if self.cullings.contains(&0) {
            return Err(ConfigError::InvalidParameter {
                name: "ga_cullings",
                reason: "every generation must keep at least one member".into(),
            });
        }
        if self.cullings.windows(2).any(|w| w[1] > w[0]) {
            return Err(ConfigError::InvalidParameter {
                name: "ga_cullings",
                reason: "surviving counts must be non-increasing".into(),
            });
        }
        if self
            .sw_thresholds
            .iter()
            .any(|t| !(*t > 0.0 && *t < 1.0))
        {
            return Err(ConfigError::InvalidParameter {
                name: "ga_sw_thresholds",
                reason: "thresholds must lie in (0, 1)".into(),
            });
        }
        if self
            .sw_gauss_sigmas
            .iter()
            .chain(&self.lowpass_sigmas)
            .any(|s| !(*s > 0.0 && s.is_finite()))
        {
            return Err(ConfigError::InvalidParameter {
                name: "ga_sigmas",
                reason: "sigmas must be positive".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconstructionConfig {
    pub algorithm_sequence: String,
    pub hio_beta: f64,
    pub initial_support_area: [f64; 3],
    pub shrink_wrap: Option<ShrinkWrapConfig>,
    pub phase_constraint: Option<PhaseConstraintConfig>,
    pub lowpass: Option<LowPassConfig>,
    pub twin: Option<TwinConfig>,
    pub coherence: Option<CoherenceConfig>,
    pub average_triggers: Vec<Trigger>,
    pub progress_triggers: Vec<Trigger>,
    /// Compute slots available to this run. `-1` denotes the host itself.
    pub devices: Vec<i32>,
    /// Free memory assumed on every configured device.
    pub device_memory_mb: u64,
    pub reconstructions: usize,
    pub ga: Option<GaConfig>,
    pub seed: Option<u64>,
}

impl ReconstructionConfig {
    pub fn is_ga(&self) -> bool {
        self.ga.is_some()
    }

    pub fn accepts_device(&self, device: i32) -> bool {
        device == -1 || self.devices.contains(&device)
    }
}

#[derive(Default)]
pub struct ReconstructionConfigBuilder {
    algorithm_sequence: Option<String>,
    hio_beta: Option<f64>,
    initial_support_area: Option<[f64; 3]>,
    shrink_wrap: Option<ShrinkWrapConfig>,
    phase_constraint: Option<PhaseConstraintConfig>,
    lowpass: Option<LowPassConfig>,
    twin: Option<TwinConfig>,
    coherence: Option<CoherenceConfig>,
    average_triggers: Vec<Trigger>,
    progress_triggers: Vec<Trigger>,
    devices: Option<Vec<i32>>,
    device_memory_mb: Option<u64>,
    reconstructions: Option<usize>,
    ga: Option<GaConfig>,
    seed: Option<u64>,
}

impl ReconstructionConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn algorithm_sequence(mut self, sequence: impl Into<String>) -> Self {
        self.algorithm_sequence = Some(sequence.into());
        self
    }
    pub fn hio_beta(mut self, beta: f64) -> Self {
        self.hio_beta = Some(beta);
        self
    }
    pub fn initial_support_area(mut self, fractions: [f64; 3]) -> Self {
        self.initial_support_area = Some(fractions);
        self
    }
    pub fn shrink_wrap(mut self, config: ShrinkWrapConfig) -> Self {
        self.shrink_wrap = Some(config);
        self
    }
    pub fn phase_constraint(mut self, config: PhaseConstraintConfig) -> Self {
        self.phase_constraint = Some(config);
        self
    }
    pub fn lowpass(mut self, config: LowPassConfig) -> Self {
        self.lowpass = Some(config);
        self
    }
    pub fn twin(mut self, config: TwinConfig) -> Self {
        self.twin = Some(config);
        self
    }
    pub fn coherence(mut self, config: CoherenceConfig) -> Self {
        self.coherence = Some(config);
        self
    }
    pub fn average_triggers(mut self, triggers: Vec<Trigger>) -> Self {
        self.average_triggers = triggers;
        self
    }
    pub fn progress_triggers(mut self, triggers: Vec<Trigger>) -> Self {
        self.progress_triggers = triggers;
        self
    }
    pub fn devices(mut self, devices: Vec<i32>) -> Self {
        self.devices = Some(devices);
        self
    }
    pub fn device_memory_mb(mut self, memory: u64) -> Self {
        self.device_memory_mb = Some(memory);
        self
    }
    pub fn reconstructions(mut self, count: usize) -> Self {
        self.reconstructions = Some(count);
        self
    }
    pub fn ga(mut self, config: GaConfig) -> Self {
        self.ga = Some(config);
        self
    }
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn build(self) -> Result<ReconstructionConfig, ConfigError> {
        let config = ReconstructionConfig {
            algorithm_sequence: self
                .algorithm_sequence
                .ok_or(ConfigError::MissingParameter("algorithm_sequence"))?,
            hio_beta: self.hio_beta.unwrap_or(0.9),
            initial_support_area: self.initial_support_area.unwrap_or([0.5; 3]),
            shrink_wrap: self.shrink_wrap,
            phase_constraint: self.phase_constraint,
            lowpass: self.lowpass,
            twin: self.twin,
            coherence: self.coherence,
            average_triggers: self.average_triggers,
            progress_triggers: self.progress_triggers,
            devices: self.devices.unwrap_or_else(|| vec![-1]),
            device_memory_mb: self.device_memory_mb.unwrap_or(8192),
            reconstructions: self.reconstructions.unwrap_or(1),
            ga: self.ga,
            seed: self.seed,
        };
        validate(&config)?;
        Ok(config)
    }
}

fn invalid(name: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidParameter {
        name,
        reason: reason.into(),
    }
}

fn validate(config: &ReconstructionConfig) -> Result<(), ConfigError> {
    if !config.hio_beta.is_finite() {
        return Err(invalid("hio_beta", "must be finite"));
    }
    if config
        .initial_support_area
        .iter()
        .any(|f| !(*f > 0.0 && *f <= 1.0))
    {
        return Err(invalid("initial_support_area", "fractions must lie in (0, 1]"));
    }
    if config.reconstructions == 0 {
        return Err(invalid("reconstructions", "at least one reconstruction required"));
    }
    if config.devices.is_empty() {
        return Err(invalid("device", "device list is empty"));
    }
    if let Some(sw) = &config.shrink_wrap {
        if !(sw.threshold > 0.0 && sw.threshold < 1.0) {
            return Err(invalid("shrink_wrap_threshold", "must lie in (0, 1)"));
        }
        if !(sw.sigma > 0.0 && sw.sigma.is_finite()) {
            return Err(invalid("shrink_wrap_gauss_sigma", "must be positive"));
        }
    }
    if let Some(phc) = &config.phase_constraint {
        if phc.phase_min >= phc.phase_max {
            return Err(invalid("phc_phase_min", "must be below phc_phase_max"));
        }
    }
    if let Some(lpf) = &config.lowpass {
        if !matches!(lpf.trigger, Trigger::Bounded { .. }) {
            return Err(ConfigError::InvalidTrigger {
                feature: "lowpass_filter",
                reason: "requires [start, step, stop]".into(),
            });
        }
        if lpf.range.iter().any(|r| !(*r > 0.0 && r.is_finite())) {
            return Err(invalid("lowpass_filter_range", "fractions must be positive"));
        }
        if !(lpf.sw_threshold > 0.0 && lpf.sw_threshold < 1.0) {
            return Err(invalid("lowpass_filter_sw_threshold", "must lie in (0, 1)"));
        }
    }
    if let Some(twin) = &config.twin {
        if twin.halves.iter().any(|h| *h > 1) {
            return Err(invalid("twin_halves", "each entry must be 0 or 1"));
        }
    }
    if let Some(pc) = &config.coherence {
        if pc.interval == 0 {
            return Err(invalid("pc_interval", "must be positive"));
        }
        if pc.lucy_iterations == 0 {
            return Err(invalid("pc_LUCY_iterations", "must be positive"));
        }
        if pc.kernel_shape.contains(&0) {
            return Err(invalid("pc_LUCY_kernel", "kernel extents must be positive"));
        }
    }
    if let Some(ga) = &config.ga {
        ga.validate()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_fills_defaults() {
        let config = ReconstructionConfigBuilder::new()
            .algorithm_sequence("10*ER")
            .build()
            .unwrap();
        assert_eq!(config.hio_beta, 0.9);
        assert_eq!(config.devices, vec![-1]);
        assert_eq!(config.reconstructions, 1);
        assert!(!config.is_ga());
    }

    #[test]
    fn builder_requires_algorithm_sequence() {
        let result = ReconstructionConfigBuilder::new().build();
        assert_eq!(
            result.unwrap_err(),
            ConfigError::MissingParameter("algorithm_sequence")
        );
    }

    #[test]
    fn trigger_arity_selects_variant() {
        assert_eq!(
            Trigger::from_values("x", &[3]).unwrap(),
            Trigger::Once { at: 3 }
        );
        assert_eq!(
            Trigger::from_values("x", &[1, 2]).unwrap(),
            Trigger::Periodic { start: 1, step: 2 }
        );
        assert_eq!(
            Trigger::from_values("x", &[1, 2, 9]).unwrap(),
            Trigger::Bounded {
                start: 1,
                step: 2,
                stop: 9
            }
        );
        assert!(Trigger::from_values("x", &[]).is_err());
        assert!(Trigger::from_values("x", &[1, 2, 3, 4]).is_err());
    }

    #[test]
    fn lowpass_requires_a_bounded_trigger() {
        let result = ReconstructionConfigBuilder::new()
            .algorithm_sequence("10*ER")
            .lowpass(LowPassConfig {
                trigger: Trigger::Periodic { start: 0, step: 1 },
                range: [0.3, 1.0],
                sw_threshold: 0.1,
            })
            .build();
        assert!(matches!(result, Err(ConfigError::InvalidTrigger { .. })));
    }

    #[test]
    fn increasing_cullings_are_rejected() {
        let ga = GaConfig {
            generations: 3,
            cullings: vec![2, 3],
            ..GaConfig::default()
        };
        assert!(ga.validate().is_err());
    }

    #[test]
    fn single_generation_ga_is_rejected() {
        let ga = GaConfig {
            generations: 1,
            ..GaConfig::default()
        };
        assert!(ga.validate().is_err());
    }

    #[test]
    fn per_generation_lists_repeat_or_pad() {
        let ga = GaConfig {
            generations: 4,
            metrics: vec![MetricType::Chi, MetricType::Area],
            breed_modes: vec![BreedMode::AvgAb],
            cullings: vec![4, 2],
            ..GaConfig::default()
        };
        assert_eq!(ga.metric(1), MetricType::Area);
        assert_eq!(ga.metric(3), MetricType::Chi);
        assert_eq!(ga.breed_mode(3), BreedMode::AvgAb);
        assert_eq!(ga.survivors(0), 4);
        assert_eq!(ga.survivors(3), 2);
        assert_eq!(GaConfig::default().survivors(5), usize::MAX);
    }

    #[test]
    fn device_acceptance_includes_host() {
        let config = ReconstructionConfigBuilder::new()
            .algorithm_sequence("ER")
            .devices(vec![0, 2])
            .build()
            .unwrap();
        assert!(config.accepts_device(-1));
        assert!(config.accepts_device(2));
        assert!(!config.accepts_device(1));
    }
}
