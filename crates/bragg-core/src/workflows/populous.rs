//! Genetic algorithm driven through generation directories.
//!
//! Each generation is a batch of independent jobs on the shared queue. Member `i` of generation
//! `g` saves into `g_<g>/<i>`, resumes from its ranked predecessor, and breeds with the image in
//! `alpha/`. When the run ends the best result is moved into the save root and the scratch
//! directories are removed.

use super::ga::{GenerationTrace, Selection};
use super::multi::{Interrupt, JobSpec, run_jobs};
use crate::core::metrics::Metric;
use crate::engine::config::ReconstructionConfig;
use crate::engine::error::EngineError;
use crate::engine::progress::{Progress, ProgressReporter};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

pub const ALPHA_DIR: &str = "alpha";

fn generation_dir(root: &Path, generation: usize) -> PathBuf {
    root.join(format!("g_{generation}"))
}

/// Copies the regular files of `from` into `to`, replacing existing ones.
fn copy_files(from: &Path, to: &Path) -> io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            fs::copy(entry.path(), to.join(entry.file_name()))?;
        }
    }
    Ok(())
}

fn remove_quietly(dir: &Path) {
    if dir.exists() {
        if let Err(e) = fs::remove_dir_all(dir) {
            warn!(dir = %dir.display(), error = %e, "Could not remove directory.");
        }
    }
}

fn member_seed(base: Option<u64>, generation: usize, index: usize) -> Option<u64> {
    base.map(|seed| {
        seed.wrapping_add((generation as u64) << 32)
            .wrapping_add(index as u64)
    })
}

/// Evolves `config.reconstructions` members for the configured number of generations.
///
/// The population shrinks to the culling count after every generation. Survivors are
/// renumbered in rank order, so member 0 of the next generation resumes from the best image.
#[instrument(skip_all, name = "populous_ga", fields(population = config.reconstructions))]
pub fn run(
    config: &ReconstructionConfig,
    data_path: &Path,
    save_root: &Path,
    slots: &[i32],
    interrupt: &Interrupt,
    reporter: &ProgressReporter,
) -> Result<GenerationTrace, EngineError> {
    let ga = config.ga.as_ref().ok_or(EngineError::PhaseFailed {
        phase: "populous_ga",
        reason: "no GA configuration".into(),
    })?;
    ga.validate()?;
    if slots.is_empty() {
        return Err(EngineError::PhaseFailed {
            phase: "populous_ga",
            reason: "no device slots".into(),
        });
    }
    fs::create_dir_all(save_root)?;
    let alpha_dir = save_root.join(ALPHA_DIR);

    let mut selection = Selection::default();
    let mut trace = GenerationTrace::default();
    let mut priors: Vec<Option<PathBuf>> = vec![None; config.reconstructions];

    for generation in 0..ga.generations {
        if interrupt.is_set() {
            info!(generation, "Interrupted; stopping before the next generation.");
            break;
        }
        reporter.report(Progress::PhaseStart {
            name: "Generation",
        });
        let gen_dir = generation_dir(save_root, generation);
        let alpha = (generation > 0 && alpha_dir.join("image.bin").is_file())
            .then(|| alpha_dir.clone());
        let jobs = priors
            .iter()
            .enumerate()
            .map(|(index, prior)| JobSpec {
                prior_dir: prior.clone(),
                alpha_dir: alpha.clone(),
                generation,
                seed: member_seed(config.seed, generation, index),
                ..JobSpec::new(index, gen_dir.join(index.to_string()))
            })
            .collect();
        let outcomes = run_jobs(config, data_path, jobs, slots, interrupt, reporter);
        reporter.report(Progress::PhaseFinish);

        let reports: Vec<(usize, Option<Metric>)> = outcomes
            .iter()
            .map(|o| (o.index, o.result.as_ref().ok().copied()))
            .collect();
        let (decision, record) = selection.decide(ga, generation, &reports);

        if let Some(member) = decision.alpha_member {
            copy_files(&gen_dir.join(member.to_string()), &alpha_dir)?;
            debug!(generation, member, "New alpha stored.");
        }
        for outcome in &outcomes {
            if !decision.survivors.contains(&outcome.index) {
                remove_quietly(&outcome.save_dir);
            }
        }
        if generation > 0 {
            remove_quietly(&generation_dir(save_root, generation - 1));
        }

        info!(
            generation,
            metric = %record.metric,
            completed = record.ranking.len(),
            survivors = decision.survivors.len(),
            alpha = ?decision.alpha_member,
            "Generation ranked."
        );
        reporter.report(Progress::GenerationComplete {
            generation,
            survivors: decision.survivors.len(),
        });
        trace.push(record);

        if decision.survivors.is_empty() {
            if interrupt.is_set() {
                break;
            }
            return Err(EngineError::PhaseFailed {
                phase: "populous_ga",
                reason: format!("no member completed generation {generation}"),
            });
        }
        priors = decision
            .survivors
            .iter()
            .map(|member| Some(gen_dir.join(member.to_string())))
            .collect();
    }

    if selection.alpha().is_none() {
        return Err(EngineError::PhaseFailed {
            phase: "populous_ga",
            reason: "no generation produced a result".into(),
        });
    }
    copy_files(&alpha_dir, save_root)?;
    for generation in 0..ga.generations {
        remove_quietly(&generation_dir(save_root, generation));
    }
    remove_quietly(&alpha_dir);
    trace.save(save_root)?;
    Ok(trace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::config::{GaConfig, ReconstructionConfigBuilder};
    use crate::workflows::single::tests::write_block_dataset;
    use tempfile::tempdir;

    fn config(population: usize, cullings: Vec<usize>) -> ReconstructionConfig {
        ReconstructionConfigBuilder::new()
            .algorithm_sequence("5*ER+5*HIO+5*ER")
            .reconstructions(population)
            .ga(GaConfig {
                generations: 3,
                cullings,
                fast: false,
                ..GaConfig::default()
            })
            .seed(11)
            .build()
            .unwrap()
    }

    #[test]
    fn population_shrinks_and_best_result_lands_in_root() {
        let dir = tempdir().unwrap();
        let data = write_block_dataset(dir.path());
        let save = dir.path().join("ga");
        let trace = run(
            &config(3, vec![2, 1]),
            &data,
            &save,
            &[-1, -1],
            &Interrupt::new(),
            &ProgressReporter::new(),
        )
        .unwrap();

        assert_eq!(trace.len(), 3);
        assert_eq!(trace.generations[0].ranking.len(), 3);
        assert_eq!(trace.generations[1].ranking.len(), 2);
        assert_eq!(trace.generations[2].ranking.len(), 1);
        for name in ["image.bin", "support.bin", "metrics.toml", "generation_trace.toml"] {
            assert!(save.join(name).is_file(), "missing {name}");
        }
        assert!(!save.join(ALPHA_DIR).exists());
        assert!(!generation_dir(&save, 2).exists());
    }

    #[test]
    fn root_metrics_match_the_retained_alpha() {
        let dir = tempdir().unwrap();
        let data = write_block_dataset(dir.path());
        let save = dir.path().join("ga");
        let trace = run(
            &config(2, vec![]),
            &data,
            &save,
            &[-1],
            &Interrupt::new(),
            &ProgressReporter::new(),
        )
        .unwrap();
        let saved: Metric = crate::core::io::read_toml(&save.join("metrics.toml")).unwrap();
        assert_eq!(trace.last().and_then(|r| r.alpha), Some(saved));
    }

    #[test]
    fn interrupted_before_the_first_generation_reports_failure() {
        let dir = tempdir().unwrap();
        let data = write_block_dataset(dir.path());
        let interrupt = Interrupt::new();
        interrupt.trigger();
        let result = run(
            &config(2, vec![]),
            &data,
            &dir.path().join("ga"),
            &[-1],
            &interrupt,
            &ProgressReporter::new(),
        );
        assert!(matches!(result, Err(EngineError::PhaseFailed { .. })));
    }
}
