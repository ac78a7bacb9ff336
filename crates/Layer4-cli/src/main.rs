//! Caravel CLI - Main entry point

mod cli;
mod settings;

use caravel_foundation::AgentKind;
use caravel_task::{probe_git_dir, RepoProbeCache};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Caravel - run AI coding agents in containers
#[derive(Parser, Debug)]
#[command(name = "caravel")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Settings file (defaults to ~/.caravel/settings.json)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one task per prompt
    Run {
        /// Prompts to run
        #[arg(required = true)]
        prompts: Vec<String>,

        /// Environment to run in
        #[arg(short, long)]
        env: Option<String>,

        /// Agent CLI to use; repeat to build a fallback chain
        #[arg(short, long = "agent")]
        agents: Vec<String>,

        /// Use the in-memory container backend instead of Docker
        #[arg(long)]
        dry_run: bool,

        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// List supported agents
    Agents,
    /// List configured environments
    Envs,
    /// Print the effective settings after migration
    Settings,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let settings = settings::load(args.settings.as_deref())?;

    match args.command {
        Command::Run {
            prompts,
            env,
            agents,
            dry_run,
            json,
        } => {
            let options = cli::RunOptions {
                prompts,
                environment: env,
                agents,
                dry_run,
                json,
            };
            let code = cli::run(&settings, options).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Command::Agents => list_agents(),
        Command::Envs => list_environments(&settings),
        Command::Settings => println!("{}", serde_json::to_string_pretty(&settings)?),
    }

    Ok(())
}

/// Print the agent capability table
fn list_agents() {
    println!("{:<10} {:<16} {:<22} {}", "CLI", "Name", "Config mount", "URL");
    println!("{}", "-".repeat(80));
    for kind in AgentKind::ALL {
        let caps = kind.capabilities();
        println!(
            "{:<10} {:<16} {:<22} {}",
            kind.cli_name(),
            caps.display_name,
            caps.config_mount,
            caps.url
        );
    }
}

/// Print configured environments with their caps and repo status
fn list_environments(settings: &caravel_foundation::Settings) {
    if settings.environments.is_empty() {
        println!("No environments configured.");
        return;
    }

    let probes = RepoProbeCache::new();
    println!("{:<14} {:<20} {:<10} {:<5} {}", "ID", "Name", "Max", "Git", "Workdir");
    println!("{}", "-".repeat(80));
    for env in &settings.environments {
        let cap = if env.max_agents_running < 0 {
            "∞".to_string()
        } else {
            env.max_agents_running.to_string()
        };
        let git = if probes.is_git_repo(env, probe_git_dir) { "yes" } else { "no" };
        let workdir = env
            .host_workdir
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("{:<14} {:<20} {:<10} {:<5} {}", env.id, env.name, cap, git, workdir);
    }
}
