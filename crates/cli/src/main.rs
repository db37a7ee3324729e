//! plinthctl: provision, inspect and tear down function deployments
//! from a shell. The destroy subcommand is the explicit cleanup path
//! for partially provisioned stacks.

#![forbid(unsafe_code)]

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use plinth_core::{CloudCredentials, ProgressSink, StackIdentity, StdoutSink};
use plinth_image::{DockerImageBuilder, RegistryConfig};
use plinth_provision::{Provisioner, DEFAULT_PROJECT};
use plinth_stack::{KubeEngine, StackManager};

#[derive(Parser, Debug)]
#[command(name = "plinthctl", version, about = "Plinth operator CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Cluster-internal exposure instead of a public load balancer
    #[arg(long = "local", global = true, env = "PLINTH_LOCAL")]
    local: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Deploy a function script and print its endpoint URL
    Provision {
        /// Logical function name (lowercase DNS label)
        name: String,
        /// Script body, inline
        #[arg(long = "script", conflicts_with = "script_file")]
        script: Option<String>,
        /// Read the script body from a file
        #[arg(long = "script-file")]
        script_file: Option<std::path::PathBuf>,
    },
    /// Tear down everything a function's stack owns
    Destroy {
        /// Logical function name
        name: String,
    },
    /// Report the function's public address, if allocated
    Status {
        /// Logical function name
        name: String,
    },
}

fn init_tracing() {
    let env = std::env::var("PLINTH_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn resolve_script(
    script: Option<String>,
    script_file: Option<std::path::PathBuf>,
) -> Result<String> {
    match (script, script_file) {
        (Some(s), None) => Ok(s),
        (None, Some(path)) => {
            std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))
        }
        (None, None) => bail!("one of --script or --script-file is required"),
        (Some(_), Some(_)) => unreachable!("clap rejects conflicting script args"),
    }
}

fn build_provisioner(creds: CloudCredentials, local: bool) -> Provisioner {
    let sink: Arc<dyn ProgressSink> = Arc::new(StdoutSink);
    let builder = Arc::new(DockerImageBuilder::new(RegistryConfig::from_env(), sink.clone()));
    let engine = Arc::new(KubeEngine::from_env());
    let manager = StackManager::new(engine, sink);
    Provisioner::new(builder, manager, creds, local)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let creds = CloudCredentials::from_env()?;

    match cli.command {
        Commands::Provision { name, script, script_file } => {
            let script = resolve_script(script, script_file)?;
            info!(name = %name, "provisioning");
            let provisioner = build_provisioner(creds, cli.local);
            let url = provisioner.provision(&name, &script).await?;
            match cli.output {
                Output::Human => println!("URL: {url}"),
                Output::Json => println!("{}", serde_json::json!({ "name": name, "url": url })),
            }
        }
        Commands::Destroy { name } => {
            let provisioner = build_provisioner(creds, cli.local);
            provisioner.destroy(&name).await?;
            match cli.output {
                Output::Human => println!("destroyed {name}"),
                Output::Json => println!("{}", serde_json::json!({ "name": name, "destroyed": true })),
            }
        }
        Commands::Status { name } => {
            let engine = KubeEngine::from_env();
            let id = StackIdentity::for_function(&name, DEFAULT_PROJECT);
            let url = engine.lookup_url(&id).await?;
            match cli.output {
                Output::Human => match &url {
                    Some(u) => println!("{name}: ready at {u}"),
                    None => println!("{name}: pending"),
                },
                Output::Json => println!(
                    "{}",
                    serde_json::json!({
                        "name": name,
                        "status": if url.is_some() { "ready" } else { "pending" },
                        "url": url,
                    })
                ),
            }
        }
    }
    Ok(())
}
