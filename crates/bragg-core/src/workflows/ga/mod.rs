//! Genetic-algorithm reconstruction with one population member per worker thread.
//!
//! Every generation the members run their flow, report a fitness to rank 0, and rank 0 ranks,
//! culls, and picks the alpha. The alpha checkpoints itself into the save directory and, unless
//! the run is over, its image is broadcast so the surviving members can breed with it. A member
//! that fails or is culled stays in the protocol as an inactive participant, so collective
//! operations never wait on it.

pub mod comm;
pub mod trace;

pub use comm::Communicator;
pub use trace::{GenerationRecord, GenerationTrace, RankedMember};

use crate::core::metrics::{Metric, MetricType};
use crate::engine::config::{GaConfig, ReconstructionConfig};
use crate::engine::error::EngineError;
use crate::engine::progress::{Progress, ProgressReporter};
use crate::engine::reconstruction::Reconstruction;
use ndarray::Array3;
use num_complex::Complex64;
use std::cmp::Ordering;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, instrument, warn};

const COORDINATOR: usize = 0;

#[derive(Clone)]
enum Message {
    Metric(Option<Metric>),
    Decision(Arc<Decision>),
    Alpha(Arc<Array3<Complex64>>),
}

/// Rank 0's verdict on one generation.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// Surviving members, best first.
    pub survivors: Vec<usize>,
    /// Member holding this generation's alpha; `None` when the previous alpha is retained.
    pub alpha_member: Option<usize>,
    /// Whether any alpha exists so far.
    pub has_alpha: bool,
}

/// Orders the reporting members best first. Ties keep member order.
pub fn rank_members(metric: MetricType, reports: &[(usize, Option<Metric>)]) -> Vec<RankedMember> {
    let mut ranking: Vec<RankedMember> = reports
        .iter()
        .filter_map(|(member, report)| {
            report.map(|m| RankedMember {
                member: *member,
                value: m.get(metric),
            })
        })
        .filter(|r| !r.value.is_nan())
        .collect();
    ranking.sort_by(|a, b| {
        if metric.higher_is_better() {
            b.value.partial_cmp(&a.value).unwrap_or(Ordering::Equal)
        } else {
            a.value.partial_cmp(&b.value).unwrap_or(Ordering::Equal)
        }
    });
    ranking
}

/// Coordinator state carried across generations.
#[derive(Debug, Default)]
pub struct Selection {
    alpha: Option<Metric>,
}

impl Selection {
    pub fn alpha(&self) -> Option<&Metric> {
        self.alpha.as_ref()
    }

    /// Ranks and culls one generation, replacing the alpha only when the generation's best is
    /// strictly better than the retained one.
    pub fn decide(
        &mut self,
        ga: &GaConfig,
        generation: usize,
        reports: &[(usize, Option<Metric>)],
    ) -> (Decision, GenerationRecord) {
        let metric = ga.metric(generation);
        let ranking = rank_members(metric, reports);
        let keep = ga.survivors(generation).min(ranking.len());
        let survivors: Vec<usize> = ranking[..keep].iter().map(|r| r.member).collect();

        let mut alpha_member = None;
        if let Some(best) = ranking.first() {
            let replaces = self
                .alpha
                .is_none_or(|previous| metric.is_better(best.value, previous.get(metric)));
            if replaces {
                alpha_member = Some(best.member);
                self.alpha = reports
                    .iter()
                    .find(|(member, _)| *member == best.member)
                    .and_then(|(_, report)| *report);
            }
        }

        let decision = Decision {
            survivors: survivors.clone(),
            alpha_member,
            has_alpha: self.alpha.is_some(),
        };
        let record = GenerationRecord {
            generation,
            metric,
            survivors,
            alpha_member,
            ranking,
            alpha: self.alpha,
        };
        (decision, record)
    }
}

fn protocol_error(expected: &str) -> EngineError {
    EngineError::Communication(format!("expected a {expected} message"))
}

fn run_member(
    engine: &mut Reconstruction,
    generation: usize,
    alpha: Option<&Array3<Complex64>>,
) -> Result<Metric, EngineError> {
    engine.init(None, None, generation)?;
    if let (true, Some(alpha)) = (generation > 0, alpha) {
        if let Err(e) = engine.breed(alpha, generation) {
            warn!(generation, error = %e, "Breeding failed; continuing un-bred.");
        }
    }
    engine.iterate()?;
    engine.get_metric()
}

fn worker(
    comm: Communicator<Message>,
    config: &ReconstructionConfig,
    ga: &GaConfig,
    data_path: &Path,
    save_dir: &Path,
    device: i32,
    reporter: &ProgressReporter,
) -> Result<Option<GenerationTrace>, EngineError> {
    let rank = comm.rank();
    let mut engine = Reconstruction::new(config.clone(), data_path);
    if let Some(seed) = config.seed {
        engine = engine.with_seed(seed.wrapping_add(rank as u64));
    }
    let mut active = match engine.init_device(device) {
        Ok(()) => true,
        Err(e) => {
            warn!(rank, device, error = %e, "Member could not start; it stays inactive.");
            false
        }
    };

    let mut alpha: Option<Arc<Array3<Complex64>>> = None;
    let mut selection = Selection::default();
    let mut trace = GenerationTrace::default();

    for generation in 0..ga.generations {
        comm.barrier();
        let report = if active {
            match run_member(&mut engine, generation, alpha.as_deref()) {
                Ok(metric) => Some(metric),
                Err(e) => {
                    warn!(rank, generation, error = %e, "Member failed; it stays inactive.");
                    active = false;
                    None
                }
            }
        } else {
            None
        };
        comm.send(COORDINATOR, Message::Metric(report))?;

        let message = if rank == COORDINATOR {
            let mut reports = Vec::with_capacity(comm.size());
            for from in 0..comm.size() {
                match comm.recv(from)? {
                    Message::Metric(report) => reports.push((from, report)),
                    _ => return Err(protocol_error("metric")),
                }
            }
            let (decision, record) = selection.decide(ga, generation, &reports);
            info!(
                generation,
                metric = %record.metric,
                reporting = record.ranking.len(),
                survivors = decision.survivors.len(),
                alpha = ?decision.alpha_member,
                "Generation ranked."
            );
            reporter.report(Progress::GenerationComplete {
                generation,
                survivors: decision.survivors.len(),
            });
            reporter.report(Progress::TaskIncrement);
            trace.push(record);
            comm.broadcast(COORDINATOR, Some(Message::Decision(Arc::new(decision))))?
        } else {
            comm.broadcast(COORDINATOR, None)?
        };
        let Message::Decision(decision) = message else {
            return Err(protocol_error("decision"));
        };

        if active && !decision.survivors.contains(&rank) {
            debug!(rank, generation, "Member culled.");
            active = false;
        }
        if decision.alpha_member == Some(rank) {
            if let Err(e) = engine.save_res(save_dir) {
                warn!(rank, generation, error = %e, "Alpha checkpoint failed.");
            }
        }

        if generation + 1 < ga.generations && decision.has_alpha {
            let root = decision.alpha_member.unwrap_or(COORDINATOR);
            let payload = if rank != root {
                None
            } else if decision.alpha_member == Some(rank) {
                engine.image().map(|image| Message::Alpha(Arc::new(image.clone())))
            } else {
                alpha.clone().map(Message::Alpha)
            };
            match comm.broadcast(root, payload)? {
                Message::Alpha(image) => alpha = Some(image),
                _ => return Err(protocol_error("alpha")),
            }
        }
    }

    if rank == COORDINATOR {
        trace.save(save_dir)?;
        Ok(Some(trace))
    } else {
        Ok(None)
    }
}

/// Runs the GA with one member per entry of `slots`. The best image is checkpointed into
/// `save_dir` together with `generation_trace.toml`.
#[instrument(skip_all, name = "ga_workflow", fields(members = slots.len()))]
pub fn run(
    config: &ReconstructionConfig,
    data_path: &Path,
    save_dir: &Path,
    slots: &[i32],
    reporter: &ProgressReporter,
) -> Result<GenerationTrace, EngineError> {
    let ga = config.ga.as_ref().ok_or(EngineError::PhaseFailed {
        phase: "ga",
        reason: "no GA configuration".into(),
    })?;
    ga.validate()?;
    if slots.is_empty() {
        return Err(EngineError::PhaseFailed {
            phase: "ga",
            reason: "no device slots".into(),
        });
    }
    fs::create_dir_all(save_dir)?;

    reporter.report(Progress::PhaseStart {
        name: "Genetic algorithm",
    });
    reporter.report(Progress::TaskStart {
        total_steps: ga.generations as u64,
    });

    let comms = Communicator::<Message>::create(slots.len());
    let results: Vec<Result<Option<GenerationTrace>, EngineError>> = thread::scope(|scope| {
        let handles: Vec<_> = comms
            .into_iter()
            .zip(slots)
            .map(|(comm, &device)| {
                scope.spawn(move || worker(comm, config, ga, data_path, save_dir, device, reporter))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle.join().unwrap_or_else(|_| {
                    Err(EngineError::Communication("worker thread panicked".into()))
                })
            })
            .collect()
    });

    reporter.report(Progress::TaskFinish);
    reporter.report(Progress::PhaseFinish);

    let mut trace = None;
    for (rank, result) in results.into_iter().enumerate() {
        match result {
            Ok(Some(t)) => trace = Some(t),
            Ok(None) => {}
            Err(e) if rank == COORDINATOR => return Err(e),
            Err(e) => warn!(rank, error = %e, "Worker ended with an error."),
        }
    }
    let trace = trace.ok_or(EngineError::PhaseFailed {
        phase: "ga",
        reason: "coordinator produced no trace".into(),
    })?;
    if trace.last().is_none_or(|record| record.alpha.is_none()) {
        return Err(EngineError::PhaseFailed {
            phase: "ga",
            reason: "no member completed a generation".into(),
        });
    }
    Ok(trace)
}
