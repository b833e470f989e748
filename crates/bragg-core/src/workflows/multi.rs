use crate::core::metrics::Metric;
use crate::engine::config::ReconstructionConfig;
use crate::engine::error::EngineError;
use crate::engine::progress::{Progress, ProgressReporter};
use crate::engine::reconstruction::Reconstruction;
use crossbeam_channel::unbounded;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tracing::{debug, info, instrument, warn};

/// Cooperative cancellation, polled between jobs.
///
/// Set either programmatically or by creating the marker file.
#[derive(Debug, Default)]
pub struct Interrupt {
    flag: AtomicBool,
    marker: Option<PathBuf>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_marker(marker: impl Into<PathBuf>) -> Self {
        Self {
            flag: AtomicBool::new(false),
            marker: Some(marker.into()),
        }
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        if self.flag.load(Ordering::SeqCst) {
            return true;
        }
        if self.marker.as_deref().is_some_and(Path::exists) {
            self.flag.store(true, Ordering::SeqCst);
            return true;
        }
        false
    }
}

/// One queued reconstruction.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub index: usize,
    pub save_dir: PathBuf,
    pub prior_dir: Option<PathBuf>,
    pub alpha_dir: Option<PathBuf>,
    pub generation: usize,
    pub seed: Option<u64>,
}

impl JobSpec {
    pub fn new(index: usize, save_dir: PathBuf) -> Self {
        Self {
            index,
            save_dir,
            prior_dir: None,
            alpha_dir: None,
            generation: 0,
            seed: None,
        }
    }
}

#[derive(Debug)]
pub struct JobOutcome {
    pub index: usize,
    pub device: i32,
    pub save_dir: PathBuf,
    pub result: Result<Metric, EngineError>,
}

fn run_job(
    config: &ReconstructionConfig,
    data_path: &Path,
    device: i32,
    job: &JobSpec,
) -> Result<Metric, EngineError> {
    let mut engine = Reconstruction::new(config.clone(), data_path);
    if let Some(seed) = job.seed {
        engine = engine.with_seed(seed);
    }
    engine.init_device(device)?;
    engine.init(job.prior_dir.as_deref(), job.alpha_dir.as_deref(), job.generation)?;
    engine.iterate()?;
    engine.save_res(&job.save_dir)?;
    engine.get_metric()
}

/// Runs `jobs` on one thread per entry of `slots`, pulling from a shared queue.
///
/// Failed jobs are reported in their outcome and do not stop the others. Once `interrupt` is
/// set, queued jobs that have not started are dropped. Outcomes are ordered by job index.
#[instrument(skip_all, fields(jobs = jobs.len(), slots = slots.len()))]
pub fn run_jobs(
    config: &ReconstructionConfig,
    data_path: &Path,
    jobs: Vec<JobSpec>,
    slots: &[i32],
    interrupt: &Interrupt,
    reporter: &ProgressReporter,
) -> Vec<JobOutcome> {
    reporter.report(Progress::TaskStart {
        total_steps: jobs.len() as u64,
    });
    let (job_tx, job_rx) = unbounded::<JobSpec>();
    let (result_tx, result_rx) = unbounded::<JobOutcome>();
    for job in jobs {
        // The receiver is alive for the whole function, so sending cannot fail.
        let _ = job_tx.send(job);
    }
    drop(job_tx);

    thread::scope(|scope| {
        for &device in slots {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            scope.spawn(move || {
                for job in job_rx.iter() {
                    if interrupt.is_set() {
                        debug!(index = job.index, "Interrupted; dropping queued job.");
                        continue;
                    }
                    let result = run_job(config, data_path, device, &job);
                    if let Err(e) = &result {
                        warn!(index = job.index, device, error = %e, "Reconstruction failed.");
                    }
                    reporter.report(Progress::TaskIncrement);
                    let outcome = JobOutcome {
                        index: job.index,
                        device,
                        save_dir: job.save_dir,
                        result,
                    };
                    if result_tx.send(outcome).is_err() {
                        break;
                    }
                }
            });
        }
    });
    drop(result_tx);

    let mut outcomes: Vec<JobOutcome> = result_rx.iter().collect();
    outcomes.sort_by_key(|o| o.index);
    reporter.report(Progress::TaskFinish);
    outcomes
}

/// Runs `config.reconstructions` independent reconstructions, saving each into
/// `save_root/<index>`.
pub fn run(
    config: &ReconstructionConfig,
    data_path: &Path,
    save_root: &Path,
    slots: &[i32],
    interrupt: &Interrupt,
    reporter: &ProgressReporter,
) -> Result<Vec<JobOutcome>, EngineError> {
    if slots.is_empty() {
        return Err(EngineError::PhaseFailed {
            phase: "multi_reconstruction",
            reason: "no device slots".into(),
        });
    }
    reporter.report(Progress::PhaseStart {
        name: "Reconstructions",
    });
    let jobs = (0..config.reconstructions)
        .map(|index| JobSpec {
            seed: config.seed.map(|s| s.wrapping_add(index as u64)),
            ..JobSpec::new(index, save_root.join(index.to_string()))
        })
        .collect();
    let outcomes = run_jobs(config, data_path, jobs, slots, interrupt, reporter);
    reporter.report(Progress::PhaseFinish);

    let succeeded = outcomes.iter().filter(|o| o.result.is_ok()).count();
    info!(
        succeeded,
        failed = outcomes.len() - succeeded,
        "Reconstructions finished."
    );
    Ok(outcomes)
}
