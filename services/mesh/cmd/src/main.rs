//! Ecash mesh simulator.
//!
//! Spawns one mesh node per configured peer, wires their loopback radios
//! together according to the link list, plays the scripted sends and
//! reports what every node delivered.

use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod logging;
mod report;
mod sim;

use config::SimConfig;
use logging::MeshLogFormatter;
use report::ReportFormat;
use sim::Simulation;

/// In-process ecash mesh simulator
#[derive(Parser, Debug)]
#[command(name = "ecash-mesh", version, about = "Simulate an offline ecash mesh in-process")]
struct Args {
    /// Scenario file (YAML); the built-in three node line is used when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Settle time before and after the script, e.g. 500ms
    #[arg(long)]
    settle: Option<humantime::Duration>,

    /// Report format written to stdout
    #[arg(long, value_enum, default_value_t = ReportFormat::Text)]
    report: ReportFormat,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("warn")
        .add_directive(format!("ecash_mesh={}", args.log_level).parse()?)
        .add_directive(format!("mesh_session={}", args.log_level).parse()?)
        .add_directive(format!("mesh_wire={}", args.log_level).parse()?)
        .add_directive(format!("mesh_storage={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .event_format(MeshLogFormatter::new("mesh"))
        .init();

    info!("Starting ecash mesh simulator v{}", env!("CARGO_PKG_VERSION"));

    let mut config = SimConfig::load(args.config.as_deref())?;
    if let Some(settle) = args.settle {
        config.settle = settle.into();
    }
    config.validate()?;

    info!(
        "Scenario: {} nodes, {} links, {} scripted sends",
        config.nodes.len(),
        config.links.len(),
        config.messages.len()
    );

    let sim = Simulation::spawn(&config)?;
    tokio::time::sleep(config.settle).await;

    let sends = sim.run_script(&config).await;
    tokio::time::sleep(config.settle).await;

    let outcome = sim.shutdown(sends).await?;
    info!(
        "Simulation finished: {} deliveries across {} nodes",
        outcome.deliveries.len(),
        outcome.nodes.len()
    );

    println!("{}", report::render(&outcome, args.report)?);
    Ok(())
}
