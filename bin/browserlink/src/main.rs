mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "browserlink")]
#[command(about = "Drive a remote browser session and its debugging bridges", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show configuration and paths
    Status,

    /// Execute a script in the remote browser
    Exec {
        /// JavaScript source to run
        #[arg(short, long)]
        script: String,

        /// Seconds to wait for the reply (overrides session.requestTimeoutSecs)
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Send a free-form task to the server
    Task {
        text: String,

        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Attach to a browser, take one screenshot, detach
    Capture {
        #[arg(short, long, default_value = "capture")]
        label: String,

        /// Debug ports to probe, in order (defaults to daemon.candidatePorts)
        #[arg(short, long, value_delimiter = ',')]
        ports: Vec<u16>,

        /// Server that receives forwarded browser logs (defaults to session.serverUrl)
        #[arg(long)]
        target: Option<String>,
    },

    /// Attach to a browser and report on it until Ctrl-C
    Watch {
        #[arg(short, long, value_delimiter = ',')]
        ports: Vec<u16>,

        #[arg(long)]
        target: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Status => {
            commands::status::run().await?;
        }
        Commands::Exec { script, timeout } => {
            commands::exec::script(script, timeout).await?;
        }
        Commands::Task { text, timeout } => {
            commands::exec::task(text, timeout).await?;
        }
        Commands::Capture {
            label,
            ports,
            target,
        } => {
            commands::capture::run(label, ports, target).await?;
        }
        Commands::Watch { ports, target } => {
            commands::watch::run(ports, target).await?;
        }
    }

    Ok(())
}
