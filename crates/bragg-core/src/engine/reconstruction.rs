use super::breeding::{self, BreedMode};
use super::config::ReconstructionConfig;
use super::error::EngineError;
use super::features::{Feature, FeatureContext, FeatureSet, FeatureUpdate, PartialCoherence};
use super::flow::{Algorithm, Flow, FlowOp, FlowOptions};
use super::progress::{Progress, ProgressReporter};
use crate::core::fft::Fft3;
use crate::core::grid::{self, Shape3, shape_of};
use crate::core::io::{ArrayFile, load_dataset, write_errors_text, write_toml};
use crate::core::metrics::Metric;
use ndarray::{Array1, Array3, Zip, s};
use num_complex::Complex64;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

const AMPLITUDE_FLOOR: f64 = 1e-9;
const DEFAULT_BREED_THRESHOLD: f64 = 0.1;
const DEFAULT_BREED_SIGMA: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    DeviceReady,
    IterReady,
    Iterating,
    Converged,
    Failed,
    Saved,
}

impl EngineState {
    pub fn name(self) -> &'static str {
        match self {
            EngineState::Uninitialized => "Uninitialized",
            EngineState::DeviceReady => "DeviceReady",
            EngineState::IterReady => "IterReady",
            EngineState::Iterating => "Iterating",
            EngineState::Converged => "Converged",
            EngineState::Failed => "Failed",
            EngineState::Saved => "Saved",
        }
    }
}

/// One phase-retrieval run over a single dataset.
///
/// The engine moves through `Uninitialized → DeviceReady → IterReady → Iterating →
/// {Converged | Failed} → Saved`. A GA member re-enters `init` from `Converged` or `Saved` at
/// every generation and keeps its image across generations.
pub struct Reconstruction {
    config: ReconstructionConfig,
    data_path: PathBuf,
    state: EngineState,
    device: Option<i32>,
    rng: StdRng,
    generation: usize,

    data: Option<Array3<f64>>,
    fft: Option<Fft3>,
    generation_data: Option<Array3<f64>>,
    image: Option<Array3<Complex64>>,
    support: Option<Array3<bool>>,
    flow: Option<Flow>,
    features: FeatureSet,
    coherence: Option<PartialCoherence>,
    errors: Vec<f64>,
}

impl Reconstruction {
    pub fn new(config: ReconstructionConfig, data_path: impl Into<PathBuf>) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            data_path: data_path.into(),
            state: EngineState::Uninitialized,
            device: None,
            rng,
            generation: 0,
            data: None,
            fft: None,
            generation_data: None,
            image: None,
            support: None,
            flow: None,
            features: FeatureSet::default(),
            coherence: None,
            errors: Vec::new(),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn config(&self) -> &ReconstructionConfig {
        &self.config
    }

    pub fn device(&self) -> Option<i32> {
        self.device
    }

    pub fn generation(&self) -> usize {
        self.generation
    }

    pub fn errors(&self) -> &[f64] {
        &self.errors
    }

    pub fn image(&self) -> Option<&Array3<Complex64>> {
        self.image.as_ref()
    }

    pub fn support(&self) -> Option<&Array3<bool>> {
        self.support.as_ref()
    }

    pub fn flow(&self) -> Option<&Flow> {
        self.flow.as_ref()
    }

    fn require(&self, operation: &'static str, allowed: &[EngineState]) -> Result<(), EngineError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(EngineError::InvalidState {
                operation,
                state: self.state.name(),
            })
        }
    }

    /// Binds the engine to a compute slot and loads the dataset with its peak moved to the
    /// origin. On failure the engine stays `Uninitialized`.
    #[instrument(skip_all, fields(device = device))]
    pub fn init_device(&mut self, device: i32) -> Result<(), EngineError> {
        self.require("init_device", &[EngineState::Uninitialized])?;
        if !self.config.accepts_device(device) {
            return Err(EngineError::Device {
                device,
                reason: format!("not among the configured devices {:?}", self.config.devices),
            });
        }
        let data = load_dataset(&self.data_path)?;
        if data.is_empty() || grid::norm_real(&data) == 0.0 {
            return Err(EngineError::Dataset(format!(
                "'{}' holds no signal",
                self.data_path.display()
            )));
        }
        let shape = shape_of(&data);
        debug!(?shape, "Dataset loaded.");

        self.fft = Some(Fft3::new(shape));
        self.data = Some(grid::origin_shift(&data));
        self.device = Some(device);
        self.state = EngineState::DeviceReady;
        Ok(())
    }

    /// Prepares the engine for one run of its flow.
    ///
    /// `prior_dir` seeds the image and support from a saved result on first initialization.
    /// For a GA generation past the first, `alpha_dir/image.bin` (when present) is bred into the
    /// member; a failed breed leaves the member un-bred.
    pub fn init(
        &mut self,
        prior_dir: Option<&Path>,
        alpha_dir: Option<&Path>,
        generation: usize,
    ) -> Result<(), EngineError> {
        self.require(
            "init",
            &[
                EngineState::DeviceReady,
                EngineState::Converged,
                EngineState::Saved,
            ],
        )?;
        let data = self.data.as_ref().ok_or(EngineError::InvalidState {
            operation: "init",
            state: self.state.name(),
        })?;

        let options = match &self.config.ga {
            Some(ga) => FlowOptions {
                suppress_one_shot: generation > 0,
                coherence_enabled: generation >= ga.pc_start_generation,
            },
            None => FlowOptions::default(),
        };
        let flow = Flow::compile(&self.config, &options)?;

        let lowpass_sigma = self.config.ga.as_ref().and_then(|ga| ga.lowpass_sigma(generation));
        let generation_data = match lowpass_sigma {
            Some(sigma) => {
                debug!(generation, sigma, "Using low-resolution data.");
                grid::gaussian_filter_centered(data, sigma)
            }
            None => data.clone(),
        };

        if self.image.is_none() {
            let (image, support) = match prior_dir {
                Some(dir) if dir.join("image.bin").is_file() => load_prior(dir, shape_of(data))?,
                _ => {
                    let support =
                        grid::centered_box(shape_of(data), self.config.initial_support_area);
                    (random_image(data, &support, &mut self.rng), support)
                }
            };
            self.image = Some(image);
            self.support = Some(support);
        }

        if flow.is_coherent() && self.coherence.is_none() {
            if let Some(pc) = &self.config.coherence {
                self.coherence = Some(PartialCoherence::new(pc, &generation_data, prior_dir)?);
            }
        }

        self.features = FeatureSet::build(&self.config, &flow);
        debug!(generation, features = ?self.features.names(), "Features armed.");
        self.flow = Some(flow);
        self.generation_data = Some(generation_data);
        self.generation = generation;
        self.errors.clear();
        self.state = EngineState::IterReady;

        if generation > 0 {
            if let Some(path) = alpha_dir.map(|dir| dir.join("image.bin")) {
                let bred = Array3::<Complex64>::read_from_path(&path)
                    .map_err(EngineError::from)
                    .and_then(|alpha| self.breed(&alpha, generation));
                if let Err(e) = bred {
                    warn!(generation, error = %e, "Breeding failed; continuing un-bred.");
                }
            }
        }
        Ok(())
    }

    /// Crosses the current image with `alpha` using the generation's breed mode, then derives a
    /// fresh support from the offspring.
    pub fn breed(
        &mut self,
        alpha: &Array3<Complex64>,
        generation: usize,
    ) -> Result<(), EngineError> {
        self.require("breed", &[EngineState::IterReady])?;
        let ga = self.config.ga.clone().unwrap_or_default();
        let mode = ga.breed_mode(generation);
        if mode == BreedMode::None {
            return Ok(());
        }
        let (Some(image), Some(fft)) = (self.image.as_ref(), self.fft.as_ref()) else {
            return Err(EngineError::InvalidState {
                operation: "breed",
                state: self.state.name(),
            });
        };
        let child = breeding::breed(mode, alpha, image, fft, &mut self.rng)?;

        let fallback = self.config.shrink_wrap.as_ref();
        let threshold = ga
            .sw_threshold(generation)
            .or(fallback.map(|sw| sw.threshold))
            .unwrap_or(DEFAULT_BREED_THRESHOLD);
        let sigma = ga
            .sw_gauss_sigma(generation)
            .or(fallback.map(|sw| sw.sigma))
            .unwrap_or(DEFAULT_BREED_SIGMA);
        self.support = Some(grid::shrink_wrap(&child, threshold, sigma));
        self.image = Some(child);
        debug!(generation, %mode, "Bred with alpha.");
        Ok(())
    }

    pub fn iterate(&mut self) -> Result<(), EngineError> {
        self.iterate_with(&ProgressReporter::new())
    }

    /// Runs the compiled flow to completion. A non-finite image stops the run with
    /// [`EngineError::Divergence`], keeping the errors recorded so far.
    #[instrument(skip_all, name = "iterate", fields(generation = self.generation))]
    pub fn iterate_with(&mut self, reporter: &ProgressReporter) -> Result<(), EngineError> {
        self.require("iterate", &[EngineState::IterReady])?;
        self.state = EngineState::Iterating;
        match self.run_flow(reporter) {
            Ok(()) => {
                self.state = EngineState::Converged;
                info!(
                    iterations = self.errors.len(),
                    error = self.errors.last().copied().unwrap_or(f64::NAN),
                    "Reconstruction finished."
                );
                Ok(())
            }
            Err(e) => {
                self.state = EngineState::Failed;
                Err(e)
            }
        }
    }

    fn run_flow(&mut self, reporter: &ProgressReporter) -> Result<(), EngineError> {
        let Self {
            config,
            fft,
            generation_data,
            image,
            support,
            flow,
            features,
            coherence,
            errors,
            state,
            ..
        } = self;
        let (Some(fft), Some(generation_data), Some(image), Some(support), Some(flow)) = (
            fft.as_ref(),
            generation_data.as_ref(),
            image.as_mut(),
            support.as_mut(),
            flow.as_ref(),
        ) else {
            return Err(EngineError::InvalidState {
                operation: "iterate",
                state: state.name(),
            });
        };

        reporter.report(Progress::TaskStart {
            total_steps: flow.iterations() as u64,
        });

        let mut iteration = 0usize;
        let mut started = false;
        let mut iter_data = generation_data.clone();
        let mut field = Array3::<Complex64>::zeros(image.raw_dim());
        let mut amplitudes: Option<Array3<f64>> = None;
        let mut average: Option<(Array3<f64>, usize)> = None;

        for op in flow.ops() {
            match op {
                FlowOp::Next => {
                    if started {
                        iteration += 1;
                        reporter.report(Progress::TaskIncrement);
                    }
                    started = true;
                }
                FlowOp::LowPassFilter | FlowOp::ShrinkWrap | FlowOp::PhaseConstraint => {
                    let context = FeatureContext {
                        iteration,
                        image: &*image,
                        data: generation_data,
                        amplitudes: None,
                    };
                    if let Some(update) = features.apply(*op, &context) {
                        apply_update(update, support, &mut iter_data);
                    }
                }
                FlowOp::ResetResolution => iter_data.assign(generation_data),
                FlowOp::ToReciprocal => {
                    field.assign(&*image);
                    fft.forward(&mut field);
                }
                FlowOp::CoherenceUpdate => {
                    if let Some(pc) = coherence.as_mut() {
                        let current = grid::magnitude(&field);
                        let context = FeatureContext {
                            iteration,
                            image: &*image,
                            data: generation_data,
                            amplitudes: Some(&current),
                        };
                        pc.apply_trigger(&context);
                    }
                }
                FlowOp::Modulus => {
                    let current = grid::magnitude(&field);
                    errors.push(project_modulus(&mut field, &current, &iter_data));
                    amplitudes = Some(current);
                }
                FlowOp::CoherentModulus => {
                    let current = grid::magnitude(&field);
                    let error = match coherence.as_ref() {
                        Some(pc) => {
                            let model = pc.convolve(fft, &current);
                            project_modulus(&mut field, &model, &iter_data)
                        }
                        None => project_modulus(&mut field, &current, &iter_data),
                    };
                    errors.push(error);
                    amplitudes = Some(current);
                }
                FlowOp::StorePreviousAmplitudes => {
                    if let (Some(pc), Some(current)) = (coherence.as_mut(), amplitudes.as_ref()) {
                        pc.store_previous(current);
                    }
                }
                FlowOp::ToDirect => fft.inverse(&mut field),
                FlowOp::Er => direct_update(Algorithm::Er, image, &field, support, 0.0, iteration)?,
                FlowOp::Hio => direct_update(
                    Algorithm::Hio,
                    image,
                    &field,
                    support,
                    config.hio_beta,
                    iteration,
                )?,
                FlowOp::TwinRemoval => {
                    if let Some(twin) = &config.twin {
                        remove_twin(image, twin.halves);
                    }
                }
                FlowOp::Average => {
                    let magnitude = grid::magnitude(image);
                    match average.as_mut() {
                        Some((sum, count)) => {
                            *sum += &magnitude;
                            *count += 1;
                        }
                        None => average = Some((magnitude, 1)),
                    }
                }
                FlowOp::Progress => {
                    info!(
                        iteration,
                        error = errors.last().copied().unwrap_or(f64::NAN),
                        "Iteration progress."
                    );
                }
            }
        }
        if started {
            reporter.report(Progress::TaskIncrement);
        }

        if let Some((sum, count)) = average {
            Zip::from(&mut *image).and(&sum).for_each(|c, &s| {
                let magnitude = c.norm();
                if magnitude > AMPLITUDE_FLOOR {
                    *c *= s / magnitude / count as f64;
                }
            });
        }
        let peak = grid::max_magnitude(image);
        if peak > 0.0 {
            image.mapv_inplace(|c| c / peak);
        }
        reporter.report(Progress::TaskFinish);
        Ok(())
    }

    /// Writes the image and support (jointly centered on the image's center of mass), the
    /// error history, the metrics, and the coherence kernel when one is active.
    #[instrument(skip_all, fields(dir = %dir.display()))]
    pub fn save_res(&mut self, dir: &Path) -> Result<(), EngineError> {
        self.require("save_res", &[EngineState::Converged, EngineState::Saved])?;
        let (Some(image), Some(support)) = (self.image.as_ref(), self.support.as_ref()) else {
            return Err(EngineError::InvalidState {
                operation: "save_res",
                state: self.state.name(),
            });
        };
        fs::create_dir_all(dir)?;
        let (image, support) = grid::center_sync(image, support);
        image.write_to_path(dir.join("image.bin"))?;
        support.write_to_path(dir.join("support.bin"))?;
        Array1::from(self.errors.clone()).write_to_path(dir.join("errors.bin"))?;
        write_errors_text(&dir.join("errors.txt"), &self.errors)?;
        write_toml(&dir.join("metrics.toml"), &self.get_metric()?)?;
        if let Some(pc) = &self.coherence {
            pc.kernel().write_to_path(dir.join("coherence.bin"))?;
        }
        self.state = EngineState::Saved;
        debug!("Results saved.");
        Ok(())
    }

    /// Fitness of the current image. Does not change the engine.
    pub fn get_metric(&self) -> Result<Metric, EngineError> {
        self.require("get_metric", &[EngineState::Converged, EngineState::Saved])?;
        let image = self.image.as_ref().ok_or(EngineError::InvalidState {
            operation: "get_metric",
            state: self.state.name(),
        })?;
        Ok(Metric::compute(image, &self.errors))
    }
}

fn load_prior(
    dir: &Path,
    expected: Shape3,
) -> Result<(Array3<Complex64>, Array3<bool>), EngineError> {
    let image = Array3::<Complex64>::read_from_path(dir.join("image.bin"))?;
    let found = shape_of(&image);
    if found != expected {
        return Err(EngineError::Shape { expected, found });
    }
    let support_path = dir.join("support.bin");
    let support = if support_path.is_file() {
        let support = Array3::<bool>::read_from_path(&support_path)?;
        let found = shape_of(&support);
        if found != expected {
            return Err(EngineError::Shape { expected, found });
        }
        support
    } else {
        grid::shrink_wrap(&image, DEFAULT_BREED_THRESHOLD, DEFAULT_BREED_SIGMA)
    };
    debug!(dir = %dir.display(), "Continuing from a prior result.");
    Ok((image, support))
}

/// Random amplitude and phase scaled so the image carries the dataset's energy, confined to
/// the support.
fn random_image(
    data: &Array3<f64>,
    support: &Array3<bool>,
    rng: &mut StdRng,
) -> Array3<Complex64> {
    let mut image = Array3::from_shape_simple_fn(data.raw_dim(), || {
        Complex64::from_polar(rng.r#gen::<f64>(), rng.gen_range(-PI..PI))
    });
    let current = grid::norm(&image);
    if current > 0.0 {
        let target = grid::norm_real(data) / (data.len() as f64).sqrt();
        image.mapv_inplace(|c| c * (target / current));
    }
    Zip::from(&mut image)
        .and(support)
        .for_each(|c, &inside| {
            if !inside {
                *c = Complex64::new(0.0, 0.0);
            }
        });
    image
}

/// Replaces the field amplitude with the measured one and returns the relative modulus error.
///
/// `model` is the amplitude the measurement is compared against: the field's own magnitude, or
/// its coherence-convolved counterpart.
fn project_modulus(field: &mut Array3<Complex64>, model: &Array3<f64>, known: &Array3<f64>) -> f64 {
    let residual: f64 = Zip::from(model)
        .and(known)
        .fold(0.0, |acc, &m, &k| if m != 0.0 { acc + (m - k) * (m - k) } else { acc });
    let known_norm = grid::norm_real(known);

    let zip = Zip::from(field).and(model).and(known);
    let project = |c: &mut Complex64, &m: &f64, &k: &f64| {
        *c *= if m > AMPLITUDE_FLOOR { k / m } else { 0.0 };
    };

    #[cfg(not(feature = "parallel"))]
    zip.for_each(project);

    #[cfg(feature = "parallel")]
    zip.par_for_each(project);

    if known_norm > 0.0 {
        residual.sqrt() / known_norm
    } else {
        0.0
    }
}

/// Direct-space constraint. `raw` is the inverse transform of the projected field.
fn direct_update(
    algorithm: Algorithm,
    image: &mut Array3<Complex64>,
    raw: &Array3<Complex64>,
    support: &Array3<bool>,
    beta: f64,
    iteration: usize,
) -> Result<(), EngineError> {
    let zip = Zip::from(&mut *image).and(raw).and(support);
    let update = |c: &mut Complex64, &r: &Complex64, &inside: &bool| {
        *c = match (inside, algorithm) {
            (true, _) => r,
            (false, Algorithm::Er) => Complex64::new(0.0, 0.0),
            (false, Algorithm::Hio) => *c - beta * r,
        };
    };

    #[cfg(not(feature = "parallel"))]
    zip.for_each(update);

    #[cfg(feature = "parallel")]
    zip.par_for_each(update);

    if !grid::is_finite(image) {
        return Err(EngineError::Divergence { iteration });
    }
    Ok(())
}

/// Zeroes one half of the image along axes 0 and 1.
fn remove_twin(image: &mut Array3<Complex64>, halves: [usize; 2]) {
    let [n0, n1, _] = shape_of(image);
    let (half_x, half_y) = ((n0 + 1) / 2, (n1 + 1) / 2);
    let zero = Complex64::new(0.0, 0.0);
    if halves[0] == 0 {
        image.slice_mut(s![half_x.., .., ..]).fill(zero);
    } else {
        image.slice_mut(s![..half_x, .., ..]).fill(zero);
    }
    if halves[1] == 0 {
        image.slice_mut(s![.., half_y.., ..]).fill(zero);
    } else {
        image.slice_mut(s![.., ..half_y, ..]).fill(zero);
    }
}

fn apply_update(update: FeatureUpdate, support: &mut Array3<bool>, iter_data: &mut Array3<f64>) {
    match update {
        FeatureUpdate::ReplaceSupport(new_support) => *support = new_support,
        FeatureUpdate::RestrictSupport(mask) => {
            Zip::from(support).and(&mask).for_each(|s, &m| *s = *s && m);
        }
        FeatureUpdate::Resolution {
            data,
            support: new_support,
        } => {
            *iter_data = data;
            *support = new_support;
        }
        FeatureUpdate::Internal => {}
    }
}
