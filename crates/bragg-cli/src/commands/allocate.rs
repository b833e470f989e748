use crate::cli::AllocateArgs;
use crate::config::PartialBraggConfig;
use crate::error::{CliError, Result};
use braggcdi::core::io::load_dataset;
use braggcdi::engine::allocator::{
    JobMode, StaticInventory, allocate_cluster, allocate_local, estimate_job_size,
};
use tracing::{info, warn};

pub fn run(args: AllocateArgs) -> Result<()> {
    let partial_config = PartialBraggConfig::from_file(&args.overrides.config)?;
    let hosts = partial_config.hosts().cloned();
    let config = partial_config.merge_with_cli(&args.overrides)?;

    let voxels = load_dataset(&args.data)
        .map_err(|e| CliError::FileParsing {
            path: args.data.clone(),
            source: e.into(),
        })?
        .len();
    let mode = JobMode::for_config(&config);
    let job_mb = estimate_job_size(voxels, mode, config.coherence.is_some());
    info!(?mode, voxels, job_mb, "Estimated memory per job.");
    println!("Each job needs about {job_mb:.1} MB.");

    let inventory = StaticInventory::from_config(&config);
    match hosts {
        Some(hosts) => {
            let allocation = allocate_cluster(&inventory, &hosts, config.reconstructions, job_mb)?;
            for assignment in &allocation.hosts {
                println!(
                    "  {}: {} job(s) on devices {:?}",
                    assignment.host,
                    assignment.devices.len(),
                    assignment.devices
                );
            }
            println!(
                "✓ {} of {} job(s) placed.",
                allocation.jobs, config.reconstructions
            );
            if let Some(path) = &args.hostfile {
                allocation.write_hostfile(path)?;
                println!("Hostfile written to: {}", path.display());
            }
        }
        None => {
            if args.hostfile.is_some() {
                warn!("--hostfile needs a [devices.hosts] table; no hostfile written.");
            }
            let allocation = allocate_local(&inventory, config.reconstructions, job_mb)?;
            println!(
                "✓ {} of {} job(s) placed on devices {:?}",
                allocation.jobs, config.reconstructions, allocation.devices
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Commands};
    use braggcdi::core::io::ArrayFile;
    use clap::Parser;
    use ndarray::Array3;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    fn parse(argv: &[&str]) -> AllocateArgs {
        match Cli::parse_from(argv).command {
            Commands::Allocate(args) => args,
            Commands::Run(_) => unreachable!("parsed an allocate command"),
        }
    }

    fn write_dataset(dir: &Path) -> String {
        let path = dir.join("data.bin");
        Array3::<f64>::ones((8, 8, 8)).write_to_path(&path).unwrap();
        path.display().to_string()
    }

    #[test]
    fn cluster_allocation_writes_hostfile() {
        let dir = tempdir().unwrap();
        let data = write_dataset(dir.path());
        let config = dir.path().join("bragg.toml");
        fs::write(
            &config,
            "algorithm-sequence = \"10*ER\"\nreconstructions = 3\n\
             [devices]\nmemory-mb = 150\n[devices.hosts]\nalpha = [0, 1]\nbeta = [0]\n",
        )
        .unwrap();
        let hostfile = dir.path().join("hosts");
        let config = config.display().to_string();
        let hostfile_arg = hostfile.display().to_string();
        let args = parse(&[
            "bragg",
            "allocate",
            "-c",
            &config,
            "-d",
            &data,
            "--hostfile",
            &hostfile_arg,
        ]);
        run(args).unwrap();
        assert_eq!(
            fs::read_to_string(hostfile).unwrap(),
            "alpha:2\nbeta:1\n"
        );
    }

    #[test]
    fn local_allocation_without_capacity_fails() {
        let dir = tempdir().unwrap();
        let data = write_dataset(dir.path());
        let config = dir.path().join("bragg.toml");
        fs::write(
            &config,
            "algorithm-sequence = \"10*ER\"\n[devices]\nmemory-mb = 1\n",
        )
        .unwrap();
        let config = config.display().to_string();
        let args = parse(&["bragg", "allocate", "-c", &config, "-d", &data]);
        assert!(matches!(run(args), Err(CliError::Allocation(_))));
    }
}
