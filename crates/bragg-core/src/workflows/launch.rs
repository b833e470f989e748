use super::ga::{self, GenerationTrace};
use super::multi::{self, Interrupt, JobOutcome};
use super::{populous, single};
use crate::core::io::load_dataset;
use crate::core::metrics::Metric;
use crate::engine::allocator::{JobMode, StaticInventory, allocate_local, estimate_job_size};
use crate::engine::config::{ConfigError, ReconstructionConfig};
use crate::engine::error::EngineError;
use crate::engine::flow::{Flow, FlowOptions};
use crate::engine::progress::ProgressReporter;
use std::path::Path;
use tracing::{info, instrument, warn};

/// Compiles the flows every worker will build, so a bad sequence or trigger fails the whole run
/// before any dataset is loaded. Later GA generations drop the one-shot features.
fn check_flows(config: &ReconstructionConfig) -> Result<(), ConfigError> {
    Flow::compile(config, &FlowOptions::default())?;
    if config.ga.is_some() {
        let later = FlowOptions {
            suppress_one_shot: true,
            ..FlowOptions::default()
        };
        Flow::compile(config, &later)?;
    }
    Ok(())
}

/// What a launched run produced.
#[derive(Debug)]
pub enum LaunchOutcome {
    Single(Metric),
    Multi(Vec<JobOutcome>),
    Ga(GenerationTrace),
}

/// Sizes the job, allocates device slots, and dispatches to the matching workflow.
///
/// A fast GA runs one member per allocated slot, so its population can be smaller than
/// `config.reconstructions` when memory is short. Every other mode queues its jobs over the slots.
#[instrument(skip_all, fields(data = %data_path.display()))]
pub fn launch(
    config: &ReconstructionConfig,
    data_path: &Path,
    save_dir: &Path,
    interrupt: &Interrupt,
    reporter: &ProgressReporter,
) -> Result<LaunchOutcome, EngineError> {
    check_flows(config)?;
    let voxels = load_dataset(data_path)?.len();
    let mode = JobMode::for_config(config);
    let job_mb = estimate_job_size(voxels, mode, config.coherence.is_some());
    let inventory = StaticInventory::from_config(config);
    let allocation = allocate_local(&inventory, config.reconstructions, job_mb)?;
    info!(
        ?mode,
        job_mb,
        jobs = allocation.jobs,
        "Devices allocated."
    );

    match mode {
        JobMode::Single if config.reconstructions == 1 => {
            let device = allocation.devices[0];
            single::run(config, data_path, save_dir, device, None, reporter)
                .map(LaunchOutcome::Single)
        }
        JobMode::Single => {
            multi::run(config, data_path, save_dir, &allocation.devices, interrupt, reporter)
                .map(LaunchOutcome::Multi)
        }
        JobMode::FastGa => {
            if allocation.jobs < config.reconstructions {
                warn!(
                    requested = config.reconstructions,
                    members = allocation.jobs,
                    "Population reduced to the allocated slots."
                );
            }
            ga::run(config, data_path, save_dir, &allocation.devices, reporter)
                .map(LaunchOutcome::Ga)
        }
        JobMode::PopulousGa => populous::run(
            config,
            data_path,
            save_dir,
            &allocation.devices,
            interrupt,
            reporter,
        )
        .map(LaunchOutcome::Ga),
    }
}
