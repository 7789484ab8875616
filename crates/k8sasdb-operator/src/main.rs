//! k8sasdb Operator
//!
//! Kubernetes operator that turns Table resources into CustomResourceDefinitions.

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use k8sasdb_operator::{
    cluster::KubeApi,
    config::OperatorConfig,
    controllers::{Context, TableController},
    crds::Table,
    index::OwnerIndex,
    synth::synthesize,
    telemetry::init_tracing,
};
use kube::CustomResourceExt;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tracing::info;

/// Placeholder uid for rendering manifests that were never stored.
const RENDER_UID: &str = "00000000-0000-0000-0000-000000000000";

#[derive(Parser)]
#[command(name = "k8sasdb-operator")]
#[command(about = "Kubernetes operator exposing Table resources as CRDs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the Table CRD manifest to stdout
    Crds,
    /// Print the CRD derived from a Table manifest
    Render {
        /// Path to a Table manifest (YAML)
        #[arg(short, long)]
        file: PathBuf,
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Run the operator
    Run {
        #[command(flatten)]
        overrides: Overrides,
    },
}

/// Flags that take precedence over environment configuration.
#[derive(clap::Args)]
struct Overrides {
    /// Group of derived CRDs
    #[arg(long)]
    derived_group: Option<String>,

    /// Use a Table's spec.customGroup as the group when set
    /// (`--honor-custom-group=false` turns it off)
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    honor_custom_group: Option<bool>,

    /// Seconds before a failed reconciliation is retried
    #[arg(long)]
    error_requeue_secs: Option<u64>,

    /// Log format (text or json)
    #[arg(long)]
    log_format: Option<String>,
}

impl Overrides {
    fn apply(self, mut config: OperatorConfig) -> OperatorConfig {
        if let Some(group) = self.derived_group {
            config.derived_group = group;
        }
        if let Some(honor) = self.honor_custom_group {
            config.honor_custom_group = honor;
        }
        if let Some(secs) = self.error_requeue_secs {
            config.error_requeue = Duration::from_secs(secs);
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Crds => print_crds(),
        Commands::Render { file, overrides } => {
            render(&file, &overrides.apply(OperatorConfig::from_env()))
        }
        Commands::Run { overrides } => {
            run_operator(overrides.apply(OperatorConfig::from_env())).await
        }
    }
}

fn print_crds() -> anyhow::Result<()> {
    println!("---");
    println!("{}", serde_yaml::to_string(&Table::crd())?);
    Ok(())
}

fn render(file: &Path, config: &OperatorConfig) -> anyhow::Result<()> {
    let manifest = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let mut table: Table = serde_yaml::from_str(&manifest).context("Failed to parse Table")?;
    table
        .metadata
        .namespace
        .get_or_insert_with(|| "default".to_string());
    table.metadata.uid.get_or_insert_with(|| RENDER_UID.to_string());

    let crd = synthesize(&table, &config.synthesis())?;
    println!("---");
    println!("{}", serde_yaml::to_string(&crd)?);
    Ok(())
}

async fn run_operator(config: OperatorConfig) -> anyhow::Result<()> {
    // Install rustls crypto provider
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    init_tracing(&config.log_format);

    info!(
        group = %config.derived_group,
        honor_custom_group = config.honor_custom_group,
        "Starting k8sasdb-operator"
    );

    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes");

    let index = OwnerIndex::new();
    let ctx = Arc::new(Context::new(
        KubeApi::new(client.clone(), index.clone()),
        &config,
    ));

    TableController::run(client, ctx, index).await;
    info!("Controller stopped");

    Ok(())
}
