use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod app;
pub mod cluster;
pub mod config;
pub mod database;
pub mod deployment;
pub mod network;
pub mod outputs;
pub mod service;
pub mod stack;
pub mod template;
pub mod writer;

/// Synthesize the network, database, cluster and service stacks.
#[derive(Debug, Parser)]
#[command(name = "cfn-stack-synth", version, about, long_about = None)]
struct Cli {
    /// Stack parameters (YAML). Built-in defaults apply when omitted.
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Target account. Templates stay environment-agnostic without it.
    #[arg(long, env = "CDK_DEFAULT_ACCOUNT", global = true)]
    account: Option<String>,

    /// Target region.
    #[arg(long, env = "CDK_DEFAULT_REGION", global = true)]
    region: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write the cloud assembly: one template per stack plus a manifest.
    Synth {
        #[arg(long, short = 'o', default_value = "cdk.out")]
        out: PathBuf,

        #[arg(long, value_enum, default_value = "json")]
        format: writer::Format,
    },

    /// Fetch the outputs of the deployed stacks into a JSON file.
    Outputs {
        #[arg(long, short = 'f', default_value = "outputs.json")]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = config::load(cli.config.as_ref())?;
    let environment = config.environment.merge(&stack::Environment {
        account: cli.account.clone(),
        region: cli.region.clone(),
    });
    if environment.is_agnostic() {
        warn!("No account or region given, synthesizing environment-agnostic stacks");
    }

    let mut app = app::App::new(environment.clone());
    let declared = deployment::declare(&mut app, &config).context("Unable to declare the stacks")?;
    info!(
        zones = declared.network.zones,
        secret = %declared.database.credential.secret_name,
        cluster = %declared.cluster.cluster_name.name,
        listener_port = declared.service.listener_port,
        "Declared deployment"
    );
    let assembly = app.synth().context("Unable to synthesize the stacks")?;

    match cli.command {
        Command::Synth { out, format } => {
            let written = writer::write(&out, &assembly, format)?;
            for stack in &assembly.stacks {
                for (resource_type, count) in stack.template.resource_summary() {
                    info!(stack = %stack.stack_id, resource_type, count, "Resources");
                }
            }
            info!(files = written.len(), out = %out.display(), "Wrote cloud assembly");
        }
        Command::Outputs { file } => {
            let stack_names: Vec<String> = assembly
                .stacks
                .iter()
                .map(|stack| stack.stack_id.clone())
                .collect();

            let outputs = outputs::Stacks::new(environment.region.as_deref())
                .await
                .get_all_outputs(&stack_names)
                .await?;
            writer::write_outputs(&file, &outputs)?;
            info!(file = %file.display(), "Wrote stack outputs");
        }
    }

    return Ok(());
}
