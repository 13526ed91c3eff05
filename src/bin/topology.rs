//! Broker topology tool.
//!
//! Loads a declarative topology document, validates it, and either applies
//! it to a RabbitMQ broker, reports what a run would do, or dumps it in
//! the management plugin's definitions format.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_error::ErrorLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use postbox::topology::declare::{self, DeclareOutcome};
use postbox::topology::rabbitmq::RabbitMqTopology;
use postbox::topology::{TopologyConfig, dump, resolve, sanitize_dsn};

#[derive(Parser, Debug)]
#[command(name = "postbox-topology")]
#[command(about = "Declare or export RabbitMQ topology from a configuration file")]
struct Args {
    /// Path to the JSON topology document.
    #[arg(long)]
    config: PathBuf,

    /// Broker connection string.
    #[arg(long, env = "AMQP_DSN", default_value = "amqp://127.0.0.1:5672/%2f")]
    dsn: String,

    /// Report planned actions without connecting to the broker.
    #[arg(long)]
    dry_run: bool,

    /// Print the topology in RabbitMQ definitions format instead of
    /// declaring it.
    #[arg(long)]
    dump: bool,

    /// Write output to a file instead of stdout (dump mode only).
    #[arg(long)]
    output: Option<PathBuf>,

    /// Virtual host recorded in dumped definitions.
    #[arg(long, default_value = "/")]
    vhost: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::from_default_env())
        .with(ErrorLayer::default())
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(&args.config)?;
    let config = TopologyConfig::from_json(&raw)?;

    if args.dump {
        let rendered = dump::dump(&config, &args.vhost)?;
        match &args.output {
            Some(path) => std::fs::write(path, rendered)?,
            None => println!("{rendered}"),
        }
        return Ok(());
    }

    let plan = resolve(&config)?;

    let outcomes = if args.dry_run {
        declare::dry_run(&plan)
    } else {
        tracing::info!(dsn = %sanitize_dsn(&args.dsn), "Connecting to broker");
        let mut client = RabbitMqTopology::connect(&args.dsn).await?;
        declare::apply(&mut client, &plan).await?
    };

    report(&outcomes);
    Ok(())
}

fn report(outcomes: &[DeclareOutcome]) {
    for outcome in outcomes {
        println!("{:<13} {}", outcome.action.as_str(), outcome.object);
    }
}
