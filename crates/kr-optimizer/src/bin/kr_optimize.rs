use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use kr_optimizer::{export_optimizer, ConstantStepConfig, Optimizer, OptimizerConfig, OptimizerKind};
use kr_scan::ParameterScan;
use kr_solve::{JobScheduler, SchedulerConfig, SolverCommand};
use kr_types::{Experiment, ProcessModel, Simulation};

#[derive(Parser, Debug)]
#[command(author, version, about = "Fit binding parameters of a process model to experiments")]
struct Cli {
    /// Study file (JSON).
    #[arg(short, long)]
    study: PathBuf,

    #[arg(short, long, default_value = "kr-results")]
    output_dir: PathBuf,

    /// Solver binary, looked up on PATH unless absolute.
    #[arg(long, default_value = "kromatic-solver")]
    solver: PathBuf,

    #[arg(short, long)]
    workers: Option<usize>,

    /// Directory for solver artifacts.
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Give up waiting after this many seconds.
    #[arg(long)]
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct Study {
    center_point: ProcessModel,
    experiments: Vec<Experiment>,
    #[serde(default)]
    optimizer: OptimizerConfig,
    #[serde(default)]
    parameter_list: Option<Vec<ParameterScan>>,
    #[serde(default)]
    constant_step: Option<ConstantStepConfig>,
}

fn main() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();

    let cli = Cli::parse();
    let raw = std::fs::read(&cli.study)
        .with_context(|| format!("reading study {}", cli.study.display()))?;
    let study: Study = serde_json::from_slice(&raw).context("parsing study file")?;

    let mut config = SchedulerConfig::default().with_solver(SolverCommand::new(&cli.solver));
    if let Some(workers) = cli.workers {
        config = config.with_max_workers(workers);
    }
    if let Some(dir) = &cli.work_dir {
        config = config.with_work_dir(dir);
    }
    let scheduler = JobScheduler::with_external_solver(config)?;

    let mut optimizer_config = study.optimizer;
    if let Some(constant_step) = study.constant_step {
        optimizer_config = optimizer_config.with_constant_step(constant_step);
    }
    let starting_points = study
        .experiments
        .iter()
        .map(|exp| {
            Arc::new(
                Simulation::new(format!("{} start", exp.name), study.center_point.clone())
                    .with_source_experiment(&exp.name),
            )
        })
        .collect();
    let targets = study.experiments.into_iter().map(Arc::new).collect();

    let mut optimizer = Optimizer::new(
        optimizer_config,
        targets,
        starting_points,
        study.parameter_list,
    )?;
    info!(
        "{} optimizer {} will run {} simulation(s)",
        optimizer.kind(),
        optimizer.name(),
        optimizer.size()
    );

    optimizer.run(&scheduler)?;
    optimizer.wait(&scheduler, cli.timeout_secs.map(Duration::from_secs))?;

    let files = export_optimizer(&optimizer, &cli.output_dir)?;
    info!("Wrote {} table(s) to {}", files.len(), cli.output_dir.display());

    for sim in optimizer.optimal_simulations()? {
        info!(
            "Optimal simulation {} ({}): {}",
            sim.name,
            sim.source_experiment.as_deref().unwrap_or("-"),
            sim.uuid
        );
    }
    if optimizer.kind() == OptimizerKind::SelfRefining {
        for model in optimizer.optimal_models()? {
            let path = cli.output_dir.join(format!("{}.json", model.name.replace(' ', "_")));
            std::fs::write(&path, serde_json::to_vec_pretty(&model.model)?)?;
            info!("Wrote optimal model {}", path.display());
        }
    }

    scheduler.shutdown();
    Ok(())
}
