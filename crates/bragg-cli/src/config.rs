use crate::cli::ConfigOverrides;
use crate::error::{CliError, Result};
use braggcdi::core::metrics::MetricType;
use braggcdi::engine::breeding::BreedMode;
use braggcdi::engine::config as core_config;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

type TriggerValues = Vec<i64>;

fn triggers(feature: &'static str, values: &[TriggerValues]) -> Result<Vec<core_config::Trigger>> {
    values
        .iter()
        .map(|v| core_config::Trigger::from_values(feature, v))
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| CliError::Config(e.to_string()))
}

fn required<T>(value: Option<T>, key: &str) -> Result<T> {
    value.ok_or_else(|| CliError::Config(format!("`{key}` is required.")))
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct PartialDevicesConfig {
    ids: Option<Vec<i32>>,
    memory_mb: Option<u64>,
    /// Cluster layout for `allocate`: host name to device ids.
    hosts: Option<BTreeMap<String, Vec<i32>>>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct PartialShrinkWrapConfig {
    triggers: Option<Vec<TriggerValues>>,
    threshold: Option<f64>,
    gauss_sigma: Option<f64>,
}

impl PartialShrinkWrapConfig {
    fn build(self) -> Result<core_config::ShrinkWrapConfig> {
        let defaults = core_config::ShrinkWrapConfig::default();
        Ok(core_config::ShrinkWrapConfig {
            triggers: match self.triggers {
                Some(values) => triggers("shrink_wrap", &values)?,
                None => defaults.triggers,
            },
            kind: core_config::ShrinkWrapKind::Gauss,
            threshold: self.threshold.unwrap_or(defaults.threshold),
            sigma: self.gauss_sigma.unwrap_or(defaults.sigma),
        })
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct PartialPhaseConstraintConfig {
    triggers: Option<Vec<TriggerValues>>,
    phase_min: Option<f64>,
    phase_max: Option<f64>,
}

impl PartialPhaseConstraintConfig {
    fn build(self) -> Result<core_config::PhaseConstraintConfig> {
        let defaults = core_config::PhaseConstraintConfig::default();
        Ok(core_config::PhaseConstraintConfig {
            triggers: match self.triggers {
                Some(values) => triggers("phase_constraint", &values)?,
                None => defaults.triggers,
            },
            phase_min: self.phase_min.unwrap_or(defaults.phase_min),
            phase_max: self.phase_max.unwrap_or(defaults.phase_max),
        })
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct PartialLowPassConfig {
    trigger: Option<TriggerValues>,
    range: Option<[f64; 2]>,
    sw_threshold: Option<f64>,
}

impl PartialLowPassConfig {
    fn build(self) -> Result<core_config::LowPassConfig> {
        let values = required(self.trigger, "lowpass.trigger")?;
        Ok(core_config::LowPassConfig {
            trigger: core_config::Trigger::from_values("lowpass_filter", &values)
                .map_err(|e| CliError::Config(e.to_string()))?,
            range: required(self.range, "lowpass.range")?,
            sw_threshold: self.sw_threshold.unwrap_or(0.1),
        })
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct PartialTwinConfig {
    triggers: Option<Vec<TriggerValues>>,
    halves: Option<[usize; 2]>,
}

impl PartialTwinConfig {
    fn build(self) -> Result<core_config::TwinConfig> {
        let values = required(self.triggers, "twin.triggers")?;
        Ok(core_config::TwinConfig {
            triggers: triggers("twin", &values)?,
            halves: self.halves.unwrap_or([0, 0]),
        })
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct PartialCoherenceConfig {
    interval: Option<usize>,
    lucy_iterations: Option<usize>,
    normalize: Option<bool>,
    kernel: Option<[usize; 3]>,
}

impl PartialCoherenceConfig {
    fn build(self) -> core_config::CoherenceConfig {
        let defaults = core_config::CoherenceConfig::default();
        core_config::CoherenceConfig {
            interval: self.interval.unwrap_or(defaults.interval),
            kind: core_config::CoherenceKind::Lucy,
            lucy_iterations: self.lucy_iterations.unwrap_or(defaults.lucy_iterations),
            normalize: self.normalize.unwrap_or(defaults.normalize),
            kernel_shape: self.kernel.unwrap_or(defaults.kernel_shape),
        }
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct PartialGaConfig {
    generations: Option<usize>,
    metrics: Option<Vec<String>>,
    breed_modes: Option<Vec<String>>,
    cullings: Option<Vec<usize>>,
    sw_thresholds: Option<Vec<f64>>,
    sw_gauss_sigmas: Option<Vec<f64>>,
    lowpass_sigmas: Option<Vec<f64>>,
    pc_start_generation: Option<usize>,
    fast: Option<bool>,
}

fn parse_all<T: FromStr<Err = String>>(values: Vec<String>) -> Result<Vec<T>> {
    values
        .iter()
        .map(|v| v.parse().map_err(CliError::Config))
        .collect()
}

impl PartialGaConfig {
    fn build(self) -> Result<core_config::GaConfig> {
        let defaults = core_config::GaConfig::default();
        Ok(core_config::GaConfig {
            generations: self.generations.unwrap_or(defaults.generations),
            metrics: match self.metrics {
                Some(values) => parse_all::<MetricType>(values)?,
                None => defaults.metrics,
            },
            breed_modes: match self.breed_modes {
                Some(values) => parse_all::<BreedMode>(values)?,
                None => defaults.breed_modes,
            },
            cullings: self.cullings.unwrap_or(defaults.cullings),
            sw_thresholds: self.sw_thresholds.unwrap_or(defaults.sw_thresholds),
            sw_gauss_sigmas: self.sw_gauss_sigmas.unwrap_or(defaults.sw_gauss_sigmas),
            lowpass_sigmas: self.lowpass_sigmas.unwrap_or(defaults.lowpass_sigmas),
            pc_start_generation: self
                .pc_start_generation
                .unwrap_or(defaults.pc_start_generation),
            fast: self.fast.unwrap_or(defaults.fast),
        })
    }
}

/// Reconstruction settings as read from TOML, before CLI overrides and defaults are applied.
#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct PartialBraggConfig {
    algorithm_sequence: Option<String>,
    hio_beta: Option<f64>,
    initial_support_area: Option<[f64; 3]>,
    reconstructions: Option<usize>,
    seed: Option<u64>,
    average_triggers: Option<Vec<TriggerValues>>,
    progress_triggers: Option<Vec<TriggerValues>>,
    devices: Option<PartialDevicesConfig>,
    shrink_wrap: Option<PartialShrinkWrapConfig>,
    phase_constraint: Option<PartialPhaseConstraintConfig>,
    lowpass: Option<PartialLowPassConfig>,
    twin: Option<PartialTwinConfig>,
    partial_coherence: Option<PartialCoherenceConfig>,
    ga: Option<PartialGaConfig>,
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| CliError::Config(format!("Invalid value for {key}: {value}")))
}

impl PartialBraggConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from file: {:?}", path);
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content).map_err(|e| CliError::FileParsing {
            path: path.to_path_buf(),
            source: e.into(),
        })
    }

    fn from_toml(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Host layout declared under `[devices.hosts]`, if any.
    pub fn hosts(&self) -> Option<&BTreeMap<String, Vec<i32>>> {
        self.devices
            .as_ref()
            .and_then(|d| d.hosts.as_ref())
            .filter(|hosts| !hosts.is_empty())
    }

    pub fn merge_with_cli(
        mut self,
        overrides: &ConfigOverrides,
    ) -> Result<core_config::ReconstructionConfig> {
        self.apply_set_values(&overrides.set_values)?;

        let devices = self.devices.take().unwrap_or_default();
        let algorithm_sequence = required(self.algorithm_sequence, "algorithm-sequence")?;

        let mut builder = core_config::ReconstructionConfigBuilder::new()
            .algorithm_sequence(algorithm_sequence)
            .reconstructions(
                overrides
                    .reconstructions
                    .or(self.reconstructions)
                    .unwrap_or(1),
            );
        if let Some(beta) = self.hio_beta {
            builder = builder.hio_beta(beta);
        }
        if let Some(area) = self.initial_support_area {
            builder = builder.initial_support_area(area);
        }
        if let Some(seed) = overrides.seed.or(self.seed) {
            builder = builder.seed(seed);
        }
        if let Some(values) = &self.average_triggers {
            builder = builder.average_triggers(triggers("average", values)?);
        }
        if let Some(values) = &self.progress_triggers {
            builder = builder.progress_triggers(triggers("progress", values)?);
        }
        if let Some(ids) = overrides.devices.clone().or(devices.ids) {
            builder = builder.devices(ids);
        }
        if let Some(memory) = devices.memory_mb {
            builder = builder.device_memory_mb(memory);
        }
        if let Some(sw) = self.shrink_wrap {
            builder = builder.shrink_wrap(sw.build()?);
        }
        if let Some(phc) = self.phase_constraint {
            builder = builder.phase_constraint(phc.build()?);
        }
        if let Some(lpf) = self.lowpass {
            builder = builder.lowpass(lpf.build()?);
        }
        if let Some(twin) = self.twin {
            builder = builder.twin(twin.build()?);
        }
        if let Some(pc) = self.partial_coherence {
            builder = builder.coherence(pc.build());
        }
        if let Some(ga) = self.ga {
            builder = builder.ga(ga.build()?);
        }

        builder.build().map_err(|e| CliError::Config(e.to_string()))
    }

    fn apply_set_values(&mut self, set_values: &[String]) -> Result<()> {
        for kv_pair in set_values {
            let Some((key, value)) = kv_pair.split_once('=') else {
                return Err(CliError::Config(format!(
                    "Invalid --set format: '{kv_pair}'. Expected KEY=VALUE."
                )));
            };
            let key = key.trim();

            match key {
                "algorithm-sequence" => self.algorithm_sequence = Some(value.trim().to_string()),
                "hio-beta" => self.hio_beta = Some(parse_value(key, value)?),
                "reconstructions" => self.reconstructions = Some(parse_value(key, value)?),
                "seed" => self.seed = Some(parse_value(key, value)?),
                "devices.memory-mb" => {
                    self.devices
                        .get_or_insert_with(Default::default)
                        .memory_mb = Some(parse_value(key, value)?);
                }
                "shrink-wrap.threshold" => {
                    self.shrink_wrap
                        .get_or_insert_with(Default::default)
                        .threshold = Some(parse_value(key, value)?);
                }
                "shrink-wrap.gauss-sigma" => {
                    self.shrink_wrap
                        .get_or_insert_with(Default::default)
                        .gauss_sigma = Some(parse_value(key, value)?);
                }
                "partial-coherence.interval" => {
                    self.partial_coherence
                        .get_or_insert_with(Default::default)
                        .interval = Some(parse_value(key, value)?);
                }
                "ga.generations" => {
                    self.ga.get_or_insert_with(Default::default).generations =
                        Some(parse_value(key, value)?);
                }
                "ga.fast" => {
                    self.ga.get_or_insert_with(Default::default).fast =
                        Some(parse_value(key, value)?);
                }
                "ga.pc-start-generation" => {
                    self.ga
                        .get_or_insert_with(Default::default)
                        .pc_start_generation = Some(parse_value(key, value)?);
                }
                _ => {
                    return Err(CliError::Config(format!(
                        "Unsupported configuration key for --set: '{key}'"
                    )));
                }
            }
        }
        Ok(())
    }
}
