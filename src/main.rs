use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use tokio_stream::StreamExt;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use listing_scout::agent::AgentSettings;
use listing_scout::brain::{Brain, StepDecider};
use listing_scout::config::{BackendArgs, Cli, Command, RunArgs};
use listing_scout::hands::ChromeLauncher;
use listing_scout::orchestrator::SiteOrchestrator;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    // stdout carries the NDJSON stream; logs go to stderr.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Probe(args) => probe(args).await,
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let plan = args.plan().context("invalid run configuration")?;
    let brain = Brain::new(args.backend.to_config()?).context("could not build decision client")?;
    info!(
        sources = plan.sources.len(),
        rules = plan.rules.len(),
        backend = %brain.label(),
        "starting run"
    );

    let orchestrator = Arc::new(
        SiteOrchestrator::new(
            Arc::new(ChromeLauncher::new(args.chrome_settings())),
            Arc::new(brain),
            plan.vehicle,
            plan.rules,
        )
        .with_agent_settings(AgentSettings {
            max_steps: args.max_steps,
            ..AgentSettings::default()
        })
        .with_visit_settings(args.visit_settings()),
    );

    // Sources are visited one after another, each with its own browser.
    for source in plan.sources {
        let mut events = orchestrator.stream_visit(source);
        while let Some(event) = events.next().await {
            let mut out = std::io::stdout().lock();
            writeln!(out, "{}", event.to_ndjson())?;
            out.flush()?;
        }
    }
    Ok(())
}

async fn probe(args: BackendArgs) -> Result<()> {
    let brain = Brain::new(args.to_config()?)?;
    let provider = brain.config().provider;
    if brain.probe().await {
        println!("{provider} backend is available");
        Ok(())
    } else {
        anyhow::bail!("{provider} backend is not available")
    }
}
