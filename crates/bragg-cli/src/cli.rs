use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

const HELP_TEMPLATE: &str = "\
{before-help}{name} {version}
{about-with-newline}
{usage-heading} {usage}

{all-args}{after-help}
";

#[derive(Parser, Debug)]
#[command(
    version,
    about = "bragg - iterative phase retrieval for 3D Bragg coherent diffraction imaging.",
    help_template = HELP_TEMPLATE,
)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity level (-v for INFO, -vv for DEBUG, -vvv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all log output except for errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Write logs to a specified file in addition to the console output
    #[arg(long, global = true, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Set the number of threads used inside each reconstruction.
    /// Defaults to the number of available logical cores.
    #[arg(short = 'j', long, global = true, value_name = "NUM")]
    pub threads: Option<usize>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Reconstruct a dataset: a single run, several independent runs, or a genetic algorithm.
    Run(RunArgs),
    /// Show how many jobs fit on the configured devices or hosts without running them.
    Allocate(AllocateArgs),
}

/// Overrides shared by every command that reads a configuration file.
#[derive(Args, Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Path to the reconstruction configuration file in TOML format.
    #[arg(short, long, required = true, value_name = "PATH")]
    pub config: PathBuf,

    /// Override the device list from the config file. `-1` denotes the host itself.
    #[arg(long, value_name = "IDS", value_delimiter = ',', allow_negative_numbers = true)]
    pub devices: Option<Vec<i32>>,

    /// Override the number of reconstructions (or the GA population size).
    #[arg(short = 'n', long, value_name = "INT")]
    pub reconstructions: Option<usize>,

    /// Override the random seed.
    #[arg(long, value_name = "INT")]
    pub seed: Option<u64>,

    /// Set a specific configuration value, overriding the config file.
    /// Can be used multiple times. Example: -S ga.generations=4
    #[arg(short = 'S', long = "set", value_name = "KEY=VALUE", num_args(0..))]
    pub set_values: Vec<String>,
}

/// Arguments for the `run` subcommand.
#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub overrides: ConfigOverrides,

    /// Path to the diffraction magnitude in the array file format.
    #[arg(short, long, required = true, value_name = "PATH")]
    pub data: PathBuf,

    /// Directory that receives the results.
    #[arg(short, long, required = true, value_name = "PATH")]
    pub save_dir: PathBuf,

    /// Stop scheduling queued reconstructions once this file exists.
    #[arg(long, value_name = "PATH")]
    pub interrupt_file: Option<PathBuf>,
}

/// Arguments for the `allocate` subcommand.
#[derive(Args, Debug)]
pub struct AllocateArgs {
    #[command(flatten)]
    pub overrides: ConfigOverrides,

    /// Path to the diffraction magnitude; its size determines the memory per job.
    #[arg(short, long, required = true, value_name = "PATH")]
    pub data: PathBuf,

    /// Write `host:count` lines for the process launcher (cluster allocations only).
    #[arg(long, value_name = "PATH")]
    pub hostfile: Option<PathBuf>,
}
