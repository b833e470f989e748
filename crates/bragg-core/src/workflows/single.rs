use crate::core::metrics::Metric;
use crate::engine::config::ReconstructionConfig;
use crate::engine::error::EngineError;
use crate::engine::progress::{Progress, ProgressReporter};
use crate::engine::reconstruction::Reconstruction;
use std::path::Path;
use tracing::{info, instrument};

/// Runs one reconstruction on `device` and saves it into `save_dir`.
#[instrument(skip_all, name = "single_reconstruction", fields(device = device))]
pub fn run(
    config: &ReconstructionConfig,
    data_path: &Path,
    save_dir: &Path,
    device: i32,
    prior_dir: Option<&Path>,
    reporter: &ProgressReporter,
) -> Result<Metric, EngineError> {
    reporter.report(Progress::PhaseStart {
        name: "Initialization",
    });
    let mut engine = Reconstruction::new(config.clone(), data_path);
    engine.init_device(device)?;
    engine.init(prior_dir, None, 0)?;
    reporter.report(Progress::PhaseFinish);

    reporter.report(Progress::PhaseStart { name: "Iteration" });
    engine.iterate_with(reporter)?;
    reporter.report(Progress::PhaseFinish);

    reporter.report(Progress::PhaseStart { name: "Saving" });
    engine.save_res(save_dir)?;
    let metric = engine.get_metric()?;
    reporter.report(Progress::PhaseFinish);

    info!(
        chi = metric.chi,
        dir = %save_dir.display(),
        "Reconstruction saved."
    );
    Ok(metric)
}
