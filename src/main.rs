//! ec2-operator entry point

use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use kube::{Client, CustomResourceExt};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ec2_operator::cloud::{CloudProvider, Ec2Provider, SimulatedCloud};
use ec2_operator::config::{LogFormat, OperatorConfig, ProviderKind};
use ec2_operator::controller::{run_controller, ControllerState};
use ec2_operator::crd::Ec2Instance;
use ec2_operator::error::{Error, Result};
use ec2_operator::rest_api::run_server;
use ec2_operator::store::{ensure_crd_installed, watch_keys, KubeStore};

#[derive(Parser)]
#[command(name = "ec2-operator")]
#[command(about = "Kubernetes operator that manages EC2 instances declared as Ec2Instance resources", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    config: OperatorConfig,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller (default)
    Run,
    /// Print the Ec2Instance CustomResourceDefinition as YAML
    Crd,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Crd => print_crd(),
        Commands::Run => {
            init_tracing(cli.config.log_format);
            run(cli.config).await
        }
    };

    if let Err(e) = result {
        error!("ec2-operator failed: {}", e);
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn print_crd() -> Result<()> {
    let yaml = serde_yaml::to_string(&Ec2Instance::crd())
        .map_err(|e| Error::ConfigError(format!("Failed to render CRD: {}", e)))?;
    print!("{}", yaml);
    Ok(())
}

async fn run(config: OperatorConfig) -> Result<()> {
    config.validate()?;
    info!(
        provider = ?config.provider,
        namespace = config.namespace.as_deref().unwrap_or("<all>"),
        "Starting ec2-operator v{}",
        env!("CARGO_PKG_VERSION")
    );

    let client = Client::try_default().await?;
    ensure_crd_installed(&client, config.namespace.as_deref()).await?;

    let cloud: Arc<dyn CloudProvider> = match config.provider {
        ProviderKind::Ec2 => Arc::new(Ec2Provider::from_env().await),
        ProviderKind::Simulated => {
            info!("Using simulated cloud provider, no EC2 instances will be launched");
            Arc::new(SimulatedCloud::new().with_auto_boot())
        }
    };

    let store = Arc::new(KubeStore::new(client.clone()));
    let state = Arc::new(ControllerState::new(store, cloud, config.timings()));

    let http_addr = config.http_addr;
    tokio::spawn(async move {
        if let Err(e) = run_server(http_addr).await {
            error!("HTTP server stopped: {}", e);
        }
    });

    let notifications = watch_keys(client, config.namespace.as_deref());
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
    };

    run_controller(state, config.runner_settings(), notifications, shutdown).await
}
