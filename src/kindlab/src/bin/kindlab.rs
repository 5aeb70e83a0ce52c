//! kindlab binary: deploy, inspect and tear down the local Kind + Cilium lab.

use clap::{Parser, Subcommand};
use kindlab::error::LabError;
use kindlab::probe::{add_hosts_entries, hosts_lines, RouteProbe};
use kindlab::{DeployOptions, Lab, LabConfig, ProcessRunner, TracingProgressReporter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const HOSTS_FILE: &str = "/etc/hosts";

#[derive(Parser, Debug)]
#[command(
    name = "kindlab",
    version,
    about = "Kind + Cilium + Gateway API + BGP demo lab"
)]
struct Cli {
    /// Configuration file (default: ./kindlab.toml, then ~/.kindlab/kindlab.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the cluster and provision everything on it
    Deploy {
        /// Do not preload chart images into the nodes
        #[arg(long)]
        skip_preload: bool,
        /// Announce service addresses over L2 instead of BGP
        #[arg(long)]
        no_bgp: bool,
        /// Do not start the Hubble UI or port-forwards
        #[arg(long)]
        no_ui: bool,
    },
    /// Summarize the current state of the lab
    Status,
    /// Probe every configured route through the gateway
    Test {
        /// Gateway address (default: discovered from the Gateway status)
        #[arg(long)]
        address: Option<String>,
    },
    /// Print hosts-file entries for the demo hostnames
    Dns {
        #[arg(long)]
        address: Option<String>,
        /// Append missing entries to /etc/hosts
        #[arg(long)]
        write: bool,
    },
    /// Sample the canary route and print the version split
    Canary {
        #[arg(long)]
        address: Option<String>,
        /// Number of requests (default from configuration)
        #[arg(long)]
        requests: Option<usize>,
    },
    /// Remove the cluster, router, background processes and generated state
    Cleanup,
}

fn main() {
    let cli = Cli::parse();

    // Default to info level if RUST_LOG not set
    let default_level = if cli.verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    let result: anyhow::Result<bool> = rt.block_on(run(cli));
    match result {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            report_error(&e);
            std::process::exit(1);
        }
    }
}

/// Returns `Ok(false)` when the command ran but its checks failed.
async fn run(cli: Cli) -> anyhow::Result<bool> {
    let config = LabConfig::load(cli.config.as_deref())?;
    let lab = Lab::new(
        Arc::new(ProcessRunner::new()),
        config,
        Arc::new(TracingProgressReporter),
    )?;

    match cli.command {
        Command::Deploy {
            skip_preload,
            no_bgp,
            no_ui,
        } => {
            let options = DeployOptions {
                skip_preload,
                skip_bgp: no_bgp,
                no_ui,
            };
            let summary = lab.deploy(&options).await?;

            println!();
            if let Some(report) = &summary.report {
                print!("{}", report);
            }
            if let Some(preload) = &summary.preload {
                println!("Images: {}", preload);
            }
            for (name, pid) in &summary.background {
                println!("Background: {} (pid {})", name, pid);
            }
            if let Some(address) = &summary.gateway_address {
                println!();
                println!("Next: kindlab dns --write && kindlab test --address {}", address);
            }
            Ok(true)
        }
        Command::Status => {
            let report = lab.status().await;
            print!("{}", report);
            Ok(report.healthy())
        }
        Command::Test { address } => {
            let address = resolve_address(&lab, address).await?;
            let probe = RouteProbe::new(&address, probe_timeout(lab.config()))?;
            let results = probe.probe_routes(&lab.config().probe.routes).await;
            for result in &results {
                println!("{}", result);
            }
            let failed = results.iter().filter(|r| !r.passed()).count();
            println!("{}/{} route(s) passed", results.len() - failed, results.len());
            Ok(failed == 0)
        }
        Command::Dns { address, write } => {
            let address = resolve_address(&lab, address).await?;
            let hostnames = &lab.config().app.hostnames;
            if write {
                let added = add_hosts_entries(Path::new(HOSTS_FILE), &address, hostnames)?;
                println!("Added {} entries to {}", added, HOSTS_FILE);
            } else {
                for line in hosts_lines(&address, hostnames) {
                    println!("{}", line);
                }
            }
            Ok(true)
        }
        Command::Canary { address, requests } => {
            let address = resolve_address(&lab, address).await?;
            let mut probe_config = lab.config().probe.clone();
            if let Some(requests) = requests {
                probe_config.canary_requests = requests;
            }
            let probe = RouteProbe::new(&address, probe_timeout(lab.config()))?;
            let tally = probe.run_canary(&probe_config).await?;
            println!("{}{}", probe_config.canary_host, probe_config.canary_path);
            print!("{}", tally);
            Ok(true)
        }
        Command::Cleanup => {
            lab.cleanup().await?;
            println!("Lab {} removed", lab.config().cluster.name);
            Ok(true)
        }
    }
}

async fn resolve_address(lab: &Lab, address: Option<String>) -> anyhow::Result<String> {
    match address {
        Some(address) => Ok(address),
        None => Ok(lab.gateway_address().await?),
    }
}

fn probe_timeout(config: &LabConfig) -> Duration {
    Duration::from_secs(config.probe.timeout_secs)
}

fn report_error(error: &anyhow::Error) {
    eprintln!("Error: {}", error);
    if let Some(lab_error) = error.downcast_ref::<LabError>() {
        if let Some(diagnostics) = lab_error.diagnostics() {
            eprintln!();
            eprintln!("Diagnostics:");
            eprintln!("{}", diagnostics);
        }
    }
}
