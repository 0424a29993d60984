use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use sweep_runner::{
    export_plot_csv, get_params_template, load_rows, plot_series, run_sweep, Progress,
    StopHandle, SweepConfig,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "sweep",
    version,
    about = "Parameter sweep runner for model checking experiments"
)]
struct Cli {
    #[arg(long)]
    config: PathBuf,
    #[arg(long)]
    get_params: bool,
    #[arg(long)]
    run: bool,
    #[arg(long)]
    plots: bool,
    #[arg(long)]
    export: bool,
    #[arg(long)]
    force: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    if !(cli.get_params || cli.run || cli.plots || cli.export) {
        return Err(anyhow!(
            "nothing to do: pass --get-params, --run, --plots or --export"
        ));
    }
    let config = SweepConfig::load(&cli.config)?;

    if cli.get_params {
        print!("{}", get_params_template(&config)?);
    }

    let mut exit_code = 0;
    if cli.run {
        let progress = Progress::default();
        let stop = StopHandle::new();
        let summary = run_sweep(&config, cli.force, &stop, &progress)?;
        println!("completed: {}", summary.completed);
        println!("skipped: {}", summary.skipped);
        println!("failed: {}", summary.failed);
        println!("total: {}", summary.total);
        if summary.failed > 0 {
            exit_code = 2;
        }
    }

    if cli.plots || cli.export {
        let dataset_path = config
            .experiment_data
            .as_ref()
            .ok_or_else(|| anyhow!("experiment_data must be set for --plots/--export"))?;
        if config.plots.is_empty() {
            return Err(anyhow!("no plots configured"));
        }
        let rows = load_rows(dataset_path)?;
        for spec in &config.plots {
            let series = plot_series(&rows, spec);
            if cli.plots {
                println!("plot: {} ({} points)", spec.name, series.len());
                for point in &series {
                    let axes = point
                        .assignment
                        .iter()
                        .map(|e| format!("{}.{}={}", e.section, e.name, e.value))
                        .collect::<Vec<_>>()
                        .join(" ");
                    println!("  {} {}={}", axes, spec.metric, point.value);
                }
            }
            if cli.export {
                let out_path = export_plot_csv(dataset_path, &rows, spec)?;
                println!("wrote: {}", out_path.display());
            }
        }
    }

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}
