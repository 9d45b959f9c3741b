use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pimflow::config::SimConfig;
use pimflow::executor::Simulator;
use pimflow::metrics::write_stage_stats;
use pimflow::model::Model;
use pimflow::request::InferRequest;
use pimflow::scheduler::Scheduler;
use pimflow::stage::SubBatchMode;

/// Cycle-level simulator for a heterogeneous SA+PIM inference accelerator.
#[derive(Parser, Debug)]
#[command(name = "pimflow", version, about)]
struct Cli {
    /// JSON config file; defaults to the GPT3-7B preset
    #[arg(long)]
    config: Option<PathBuf>,

    /// Scheduling mode override: "two-way" or "three-way"
    #[arg(long)]
    mode: Option<String>,

    /// Number of requests to enqueue
    #[arg(long, default_value_t = 8)]
    requests: u32,

    /// Prompt length of the first request
    #[arg(long, default_value_t = 64)]
    input: u32,

    /// Prompt length step between consecutive requests (wraps every 8)
    #[arg(long, default_value_t = 32)]
    input_stride: u32,

    /// Tokens to decode per request
    #[arg(long, default_value_t = 4)]
    output: u32,

    /// Directory for per-stage and per-operation stat files
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Publish live metrics for the viz binary every N cycles (0 = off)
    #[arg(long, default_value_t = 0)]
    live: u64,

    /// Hard cycle cap for the run
    #[arg(long, default_value_t = 100_000_000)]
    max_cycles: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let mut cfg = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str::<SimConfig>(&raw).context("parsing config")?
        }
        None => SimConfig::gpt3_7b(),
    };
    if let Some(mode) = &cli.mode {
        cfg.sub_batch_mode = match mode.as_str() {
            "two-way" => SubBatchMode::TwoWay,
            "three-way" => SubBatchMode::ThreeWay,
            other => bail!("unknown mode {other:?} (expected two-way or three-way)"),
        };
    }
    if cli.log_dir.is_some() {
        cfg.log_dir = cli.log_dir.clone();
    }
    cfg.validate()?;

    info!(
        mode = ?cfg.sub_batch_mode,
        channels = cfg.dram_channels,
        load_balancing = cfg.ch_load_balancing,
        "simulation configured"
    );

    let model = Model::new("gpt3", &cfg);
    let platforms = cfg.sub_batch_mode.platforms();
    let log_dir = cfg.log_dir.clone();

    let mut scheduler = Scheduler::new(cfg)?;
    scheduler.launch(model);
    for i in 0..cli.requests {
        let input = cli.input + cli.input_stride * (i % 8);
        scheduler.add_request(InferRequest::new(i, input, cli.output));
    }

    let mut sim = Simulator::new(scheduler, platforms);
    sim.snapshot_interval = cli.live;
    let report = sim.run(cli.max_cycles);

    info!(
        "{} of {} requests served in {} cycles",
        report.completed.len(),
        cli.requests,
        report.cycles
    );
    sim.scheduler.print_stat();

    if let Some(dir) = &log_dir {
        write_stage_stats(dir, &report.stage_cycles)
            .with_context(|| format!("writing stage stats to {}", dir.display()))?;
    }

    Ok(())
}
