use crate::cli::RunArgs;
use crate::config::PartialBraggConfig;
use crate::error::{CliError, Result};
use crate::utils::progress::CliProgressHandler;
use braggcdi::engine::progress::ProgressReporter;
use braggcdi::workflows::{self, Interrupt, LaunchOutcome};
use tracing::{info, warn};

pub fn run(args: RunArgs) -> Result<()> {
    let partial_config = PartialBraggConfig::from_file(&args.overrides.config)?;
    info!("Merging configuration from file and CLI arguments...");
    let config = partial_config.merge_with_cli(&args.overrides)?;

    if !args.data.is_file() {
        return Err(CliError::Argument(format!(
            "Dataset not found: {}",
            args.data.display()
        )));
    }

    let interrupt = match &args.interrupt_file {
        Some(marker) => {
            info!("Queued work stops once {:?} exists.", marker);
            Interrupt::with_marker(marker)
        }
        None => Interrupt::new(),
    };

    let progress_handler = CliProgressHandler::new();
    let reporter = ProgressReporter::with_callback(progress_handler.get_callback());

    println!("Starting reconstruction...");
    let outcome = workflows::launch(&config, &args.data, &args.save_dir, &interrupt, &reporter)?;

    match outcome {
        LaunchOutcome::Single(metric) => {
            println!(
                "✓ Reconstruction (chi {:.4e}) written to: {}",
                metric.chi,
                args.save_dir.display()
            );
        }
        LaunchOutcome::Multi(outcomes) => {
            let succeeded = outcomes.iter().filter(|o| o.result.is_ok()).count();
            for outcome in &outcomes {
                match &outcome.result {
                    Ok(metric) => println!(
                        "  Reconstruction {} (chi {:.4e}) written to: {}",
                        outcome.index,
                        metric.chi,
                        outcome.save_dir.display()
                    ),
                    Err(e) => {
                        warn!(index = outcome.index, error = %e, "Reconstruction failed.");
                        println!("  Reconstruction {} failed: {}", outcome.index, e);
                    }
                }
            }
            println!(
                "✓ {succeeded} of {} reconstruction(s) completed.",
                outcomes.len()
            );
        }
        LaunchOutcome::Ga(trace) => {
            let best = trace.last().and_then(|record| record.alpha);
            match best {
                Some(metric) => println!(
                    "✓ Best of {} generation(s) (chi {:.4e}) written to: {}",
                    trace.len(),
                    metric.chi,
                    args.save_dir.display()
                ),
                None => println!("Genetic algorithm finished without a result."),
            }
        }
    }

    Ok(())
}
