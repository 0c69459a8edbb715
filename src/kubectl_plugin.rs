//! kubectl-ec2: A kubectl plugin for inspecting Ec2Instance resources
//!
//! This plugin provides convenient commands to interact with Ec2Instance resources:
//! - `kubectl ec2 list` - List Ec2Instance resources with their instance state
//! - `kubectl ec2 status <name>` - Show the recorded EC2 instance of one resource

use std::process;

use chrono::Utc;
use clap::{Parser, Subcommand};
use kube::{api::Api, Client, ResourceExt};
use serde::Serialize;

use ec2_operator::controller::finalizers::has_finalizer;
use ec2_operator::crd::Ec2Instance;
use ec2_operator::error::{Error, Result};

#[derive(Parser)]
#[command(name = "kubectl-ec2")]
#[command(about = "A kubectl plugin for inspecting Ec2Instance resources", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Kubernetes namespace (defaults to "default")
    #[arg(short, long, global = true)]
    namespace: Option<String>,

    /// Output format (table, json, yaml)
    #[arg(short, long, global = true, default_value = "table")]
    output: String,
}

#[derive(Subcommand)]
enum Commands {
    /// List Ec2Instance resources
    List {
        /// Show all namespaces
        #[arg(short = 'A', long)]
        all_namespaces: bool,
    },
    /// Show the EC2 instance recorded for an Ec2Instance
    Status {
        /// Name of the Ec2Instance
        name: String,
    },
}

/// Flattened view of one resource, used for status output
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InstanceSummary {
    namespace: String,
    name: String,
    phase: String,
    instance_id: String,
    state: String,
    region: String,
    instance_type: String,
    image_id: String,
    public_ip: String,
    private_ip: String,
    public_dns: String,
    private_dns: String,
    recreations: u32,
    finalizer_attached: bool,
    age: String,
}

impl InstanceSummary {
    fn of(instance: &Ec2Instance) -> Self {
        let status = instance.status.clone().unwrap_or_default();
        Self {
            namespace: instance.namespace().unwrap_or_else(|| "default".to_string()),
            name: instance.name_any(),
            phase: instance.phase().to_string(),
            instance_id: status.instance_id,
            state: status.state.to_string(),
            region: instance.spec.region.clone(),
            instance_type: instance.spec.instance_type.clone(),
            image_id: instance.spec.image_id.clone(),
            public_ip: status.public_ip,
            private_ip: status.private_ip,
            public_dns: status.public_dns,
            private_dns: status.private_dns,
            recreations: status.recreations,
            finalizer_attached: has_finalizer(instance),
            age: age_of(instance),
        }
    }
}

/// Human readable age, kubectl style (e.g. 45s, 12m, 3h, 5d)
fn age_of(instance: &Ec2Instance) -> String {
    let Some(created) = instance.creation_timestamp() else {
        return "<unknown>".to_string();
    };
    let secs = (Utc::now() - created.0).num_seconds().max(0);
    match secs {
        s if s < 60 => format!("{}s", s),
        s if s < 3600 => format!("{}m", s / 60),
        s if s < 86400 => format!("{}h", s / 3600),
        s => format!("{}d", s / 86400),
    }
}

fn or_none(value: &str) -> &str {
    if value.is_empty() {
        "<none>"
    } else {
        value
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let client = Client::try_default().await.map_err(Error::KubeError)?;
    let namespace = cli.namespace.as_deref().unwrap_or("default");

    match cli.command {
        Commands::List { all_namespaces } => {
            list_instances(&client, all_namespaces, namespace, &cli.output).await
        }
        Commands::Status { name } => status(&client, namespace, &name, &cli.output).await,
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value)
        .map_err(|e| Error::ConfigError(format!("JSON serialization error: {}", e)))
}

fn to_yaml<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_yaml::to_string(value)
        .map_err(|e| Error::ConfigError(format!("YAML serialization error: {}", e)))
}

/// Helper function to format the instance list as a table
fn format_instances_table(instances: &[Ec2Instance], show_namespace: bool) {
    if show_namespace {
        print!("{:<15} ", "NAMESPACE");
    }
    println!(
        "{:<30} {:<14} {:<21} {:<14} {:<16} {:<8}",
        "NAME", "PHASE", "INSTANCE", "STATE", "PUBLIC IP", "AGE"
    );
    for instance in instances {
        let summary = InstanceSummary::of(instance);
        if show_namespace {
            print!("{:<15} ", summary.namespace);
        }
        println!(
            "{:<30} {:<14} {:<21} {:<14} {:<16} {:<8}",
            summary.name,
            summary.phase,
            or_none(&summary.instance_id),
            or_none(&summary.state),
            or_none(&summary.public_ip),
            summary.age
        );
    }
}

/// List Ec2Instance resources
async fn list_instances(
    client: &Client,
    all_namespaces: bool,
    namespace: &str,
    output: &str,
) -> Result<()> {
    let api: Api<Ec2Instance> = if all_namespaces {
        Api::all(client.clone())
    } else {
        Api::namespaced(client.clone(), namespace)
    };
    let instances = api
        .list(&Default::default())
        .await
        .map_err(Error::KubeError)?
        .items;

    match output {
        "json" => println!("{}", to_json(&instances)?),
        "yaml" => println!("{}", to_yaml(&instances)?),
        _ => {
            if instances.is_empty() {
                println!("No Ec2Instance resources found.");
            } else {
                format_instances_table(&instances, all_namespaces);
            }
        }
    }

    Ok(())
}

/// Show the recorded state of one Ec2Instance
async fn status(client: &Client, namespace: &str, name: &str, output: &str) -> Result<()> {
    let api: Api<Ec2Instance> = Api::namespaced(client.clone(), namespace);
    let instance = api.get_opt(name).await.map_err(Error::KubeError)?.ok_or_else(|| {
        Error::NotFound {
            kind: "Ec2Instance".to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
        }
    })?;
    let summary = InstanceSummary::of(&instance);

    match output {
        "json" => println!("{}", to_json(&summary)?),
        "yaml" => println!("{}", to_yaml(&summary)?),
        _ => {
            println!("Name:          {}/{}", summary.namespace, summary.name);
            println!("Phase:         {}", summary.phase);
            println!("Instance ID:   {}", or_none(&summary.instance_id));
            println!("State:         {}", or_none(&summary.state));
            println!("Region:        {}", summary.region);
            println!("Type:          {}", summary.instance_type);
            println!("Image:         {}", summary.image_id);
            println!("Public IP:     {}", or_none(&summary.public_ip));
            println!("Private IP:    {}", or_none(&summary.private_ip));
            println!("Public DNS:    {}", or_none(&summary.public_dns));
            println!("Private DNS:   {}", or_none(&summary.private_dns));
            println!("Recreations:   {}", summary.recreations);
            println!(
                "Finalizer:     {}",
                if summary.finalizer_attached { "attached" } else { "missing" }
            );
            println!("Age:           {}", summary.age);
        }
    }

    Ok(())
}
