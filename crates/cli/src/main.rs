//! perfscope CLI
//!
//! Fetches CPU profiles of running Kubernetes containers from the perfscope
//! agent on the container's node.

mod client;
mod commands;
mod config;
mod discovery;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::profile::{self, ProfileArgs};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const DEFAULT_AGENT_NAMESPACE: &str = "perfscope";
const DEFAULT_OUTPUT_DIR: &str = "/tmp";

/// perfscope CLI
#[derive(Parser)]
#[command(name = "perfscope")]
#[command(author, version, about = "On-demand CPU profiling of Kubernetes containers", long_about = None)]
pub struct Cli {
    /// Path to kubeconfig file (uses default if not specified)
    #[arg(long, env = "KUBECONFIG", global = true)]
    pub kubeconfig: Option<String>,

    /// Enable verbose output
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Perform CPU profiling on the target container
    Profile {
        /// Name of the pod to profile
        pod: String,

        /// Namespace of the pod
        #[arg(long, short, default_value = "default")]
        namespace: String,

        /// Container to profile (defaults to the pod's first container)
        #[arg(long, short)]
        container: Option<String>,

        /// Namespace the perfscope agent runs in
        #[arg(long)]
        agent_namespace: Option<String>,

        /// How long to sample for (e.g. 30s, 2m)
        #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
        timeout: Duration,

        /// Extra time allowed on top of --timeout for symbolization and transfer
        #[arg(long, default_value = "2m", value_parser = humantime::parse_duration)]
        grace: Duration,

        /// Directory to write <pod>.script to
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .compact()
        .init();

    if let Err(e) = run(cli).await {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let file_config = config::Config::load()?;

    match cli.command {
        Commands::Profile {
            pod,
            namespace,
            container,
            agent_namespace,
            timeout,
            grace,
            output_dir,
        } => {
            let args = ProfileArgs {
                pod,
                namespace,
                container,
                agent_namespace: agent_namespace
                    .or(file_config.agent_namespace)
                    .unwrap_or_else(|| DEFAULT_AGENT_NAMESPACE.to_string()),
                timeout,
                grace,
                output_dir: output_dir
                    .or(file_config.output_dir)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            };
            profile::run(cli.kubeconfig.as_deref(), args).await
        }
    }
}
