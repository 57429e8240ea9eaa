/*
newsbrief - main.rs
Runs the daily news pipeline (or a single stage of it) for one date, then exits.
Scheduling is left to cron or a systemd timer.
*/

use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use common::Config;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use newsbrief::{Pipeline, PipelineState, Stage};

#[derive(Parser, Debug)]
#[command(name = "newsbrief", about = "Daily news brief: fetch, dedup, select, summarize, write, publish")]
struct Args {
    /// Path to config.toml
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Override log level (info, debug, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug)]
struct DateArg {
    /// Date to process (YYYY-MM-DD), defaults to today
    #[arg(long, value_name = "YYYY-MM-DD")]
    date: Option<NaiveDate>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the pipeline for one date
    Run {
        #[command(flatten)]
        date: DateArg,

        /// Stop before publishing
        #[arg(long)]
        dry_run: bool,

        /// Start at this stage, reading earlier output from disk
        #[arg(long, value_enum, conflicts_with = "resume")]
        from: Option<Stage>,

        /// Start at the first stage without output for the date
        #[arg(long)]
        resume: bool,
    },
    /// Fetch articles from every configured source
    Fetch(DateArg),
    /// Remove near-duplicate articles
    Dedup(DateArg),
    /// Pick the day's articles
    Select(DateArg),
    /// Summarize the selected articles
    Summarize(DateArg),
    /// Render the markdown page
    Write(DateArg),
    /// Commit and push the rendered page
    Publish(DateArg),
}

impl DateArg {
    fn resolve(&self) -> NaiveDate {
        self.date.unwrap_or_else(|| chrono::Local::now().date_naive())
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    // Parse CLI args
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    // Resolve config paths
    let default_path = PathBuf::from("config.default.toml");

    let override_path = if let Some(p) = args.config {
        if !p.exists() {
            error!(path = ?p, "specified config file not found");
            return Err(anyhow::anyhow!("Config file not found: {}", p.display()));
        }
        Some(p)
    } else {
        let p = PathBuf::from("config.toml");
        if p.exists() { Some(p) } else { None }
    };

    // Load configuration with defaults
    let config = match Config::load_with_defaults(
        if default_path.exists() { Some(default_path.as_path()) } else { None },
        override_path.as_deref(),
    )
    .await
    {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(%e, "failed to load configuration");
            return Err(e);
        }
    };
    info!(default = ?default_path, override = ?override_path, "configuration loaded");

    let pipeline = Pipeline::from_config(&config)?;

    let state = match args.command {
        Command::Run {
            date,
            dry_run,
            from,
            resume,
        } => {
            let date = date.resolve();
            let start = if resume {
                let stage = pipeline.resume_point(date);
                info!("Resuming {} at {}", date, stage);
                stage
            } else {
                from.unwrap_or(Stage::Fetch)
            };
            pipeline.run_from(date, dry_run, start).await?
        }
        Command::Fetch(d) => run_single(&pipeline, d.resolve(), Stage::Fetch).await?,
        Command::Dedup(d) => run_single(&pipeline, d.resolve(), Stage::Dedup).await?,
        Command::Select(d) => run_single(&pipeline, d.resolve(), Stage::Select).await?,
        Command::Summarize(d) => run_single(&pipeline, d.resolve(), Stage::Summarize).await?,
        Command::Write(d) => run_single(&pipeline, d.resolve(), Stage::Write).await?,
        Command::Publish(d) => run_single(&pipeline, d.resolve(), Stage::Publish).await?,
    };

    for (stage, duration) in &state.durations {
        info!("  {:<10} {:>8.2}s", stage.to_string(), duration.as_secs_f64());
    }
    info!(phase = ?state.phase, tokens = state.tokens_used, "done");
    Ok(())
}

async fn run_single(pipeline: &Pipeline, date: NaiveDate, stage: Stage) -> Result<PipelineState> {
    let mut state = PipelineState::new(date, false);
    pipeline.run_stage(&mut state, stage).await?;
    Ok(state)
}
