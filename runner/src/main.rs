use clap::Parser;
use std::{path::PathBuf, process::ExitCode, sync::Arc};
use tracing::{error, info_span};
use tracing_subscriber::EnvFilter;

mod comm;
mod config;
mod jobs;
mod launch;
mod materialize;
mod params;
mod pool;
mod protocol;
mod tasks;

#[cfg(test)]
mod materialize_test;
#[cfg(test)]
mod params_test;

use crate::{
    comm::World,
    config::{BatchConfig, ConfigErrors},
    jobs::{exec::ExecJob, Job},
    launch::Mode,
    protocol::RunError,
};

/// Farm a batch of parameter-fit tasks over a pool of cooperating processes.
///
/// Rank 0 hands out task indices; the remaining ranks form worker groups
/// that materialize each task from the template and run the job command.
#[derive(Parser, Debug)]
#[command(name = "fitfarm-runner", version, about)]
pub struct Args {
    /// ranks assigned to each independent worker group
    pub cpus_per_worker: usize,

    /// task dimension as `name: [a, b, c]` or `name: 0..4`; the tasks are
    /// the product of all dimensions given
    #[arg(short, long, required = true)]
    pub iterate: Vec<String>,

    /// the template parameter file, with `{name}` placeholders
    #[arg(short, long)]
    pub params: PathBuf,

    /// the job command, as a single string with `{name}` placeholders
    #[arg(long)]
    pub cmd: String,

    /// YAML file of extra per-task substitution lists
    #[arg(long)]
    pub extras: Option<PathBuf>,

    /// YAML file of keyed parameter overrides, `<name>_<value>` -> updates
    #[arg(long)]
    pub update_values: Option<PathBuf>,

    /// kill a job that runs longer than this many seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// total ranks to launch; required unless attached to a running pool
    #[arg(short = 'n', long)]
    pub ranks: Option<usize>,

    /// run every rank as a thread of this process instead of spawning
    #[arg(long)]
    pub inproc: bool,

    /// set the logging output to debug, with lots more info printed
    #[arg(long)]
    pub debug: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.debug);

    match run(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(error) => {
            error!("run failed: {error}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<bool, RunError> {
    let config = BatchConfig::load(args)?;

    if args.inproc {
        let ranks = args.ranks.ok_or(ConfigErrors::MissingWorldSize)?;
        let config = Arc::new(config);
        let job = ExecJob::new(config.timeout);
        let results = launch::run_inproc(ranks, move |world| rank_main(&world, &config, &job));

        return Ok(results.iter().all(Result::is_ok));
    }

    let mode = launch::mode_from_env()?;
    let ranks = match &mode {
        Mode::Parent => args.ranks.ok_or(ConfigErrors::MissingWorldSize)?,
        Mode::Attached { size, .. } => *size,
    };
    let (world, children) = launch::establish(mode, ranks)?;

    let job = ExecJob::new(config.timeout);
    if let Err(error) = rank_main(&world, &config, &job) {
        error!(
            "an error has occurred on rank {}...all ranks exiting: {error}",
            world.rank()
        );
        world.abort(1);
    }

    world.shutdown();
    Ok(launch::wait_children(children))
}

/// one rank's whole life inside an established world
fn rank_main<J: Job>(world: &World, config: &BatchConfig, job: &J) -> Result<(), RunError> {
    let span = info_span!("rank", rank = world.rank(), host = %launch::hostname());
    let _guard = span.enter();

    protocol::run(world, config, job)
}

fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .init();
}
