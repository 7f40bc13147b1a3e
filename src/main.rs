use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::info;

use rapcom::agent::{self, config::Settings};
use rapcom::transport::controller::{build_message, CommandChannel, LocalController, RelayController};
use rapcom::utils;

#[derive(Parser)]
#[command(name = "rapcom", version, about = "Rapcom remote control agent")]
struct AppCli {
    /// Run in daemon mode (background)
    #[arg(long)]
    daemon: bool,

    /// Settings file path
    #[arg(short, long, default_value = "rapcom.json", global = true)]
    settings: String,

    /// Subcommands
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent: local HTTP endpoint plus relay polling (default)
    Serve {
        /// Relay channel to answer on
        #[arg(long)]
        channel: Option<String>,
        /// Preferred local port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Send a command to a device and print the result
    Send {
        /// Command name, e.g. GetConfig
        command: String,
        /// Up to four values (JSON, or plain strings)
        values: Vec<String>,
        /// Talk to the device directly at this base URL instead of the relay
        #[arg(long)]
        local: Option<String>,
        /// Relay channel of the device
        #[arg(long)]
        channel: Option<String>,
        /// Do not wait for the device's answer
        #[arg(long)]
        no_wait: bool,
    },
}

fn run_daemon() -> Result<()> {
    use daemonize::Daemonize;
    let daemonize = Daemonize::new()
        .pid_file("rapcom.pid")
        .working_directory(".")
        .umask(0o027)
        .privileged_action(|| {
            info!("daemon started");
        });

    daemonize.start().map_err(|e| anyhow::anyhow!(e))?;
    Ok(())
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::from(raw))
}

async fn send(
    settings: Settings,
    command: String,
    values: Vec<String>,
    local: Option<String>,
    no_wait: bool,
) -> Result<()> {
    let channel: Box<dyn CommandChannel> = match local {
        Some(base_url) => Box::new(LocalController::new(&base_url)?),
        None => Box::new(RelayController::new(&settings.relay_url, &settings.channel)?),
    };

    let values: Vec<Value> = values.iter().map(|v| parse_value(v)).collect();
    match channel.send(build_message(&command, &values), !no_wait).await? {
        Some(result) => println!(
            "{}",
            serde_json::to_string_pretty(&result.to_value()).context("formatting result")?
        ),
        None => println!("sent"),
    }
    Ok(())
}

async fn run(args: AppCli) -> Result<()> {
    let mut settings = Settings::from_file(&args.settings)?;

    match args.command {
        Some(Commands::Send {
            command,
            values,
            local,
            channel,
            no_wait,
        }) => {
            if let Some(channel) = channel {
                settings.channel = channel;
            }
            send(settings, command, values, local, no_wait).await?;
        }
        Some(Commands::Serve { channel, port }) => {
            if let Some(channel) = channel {
                settings.channel = channel;
            }
            if let Some(port) = port {
                settings.local_port = port;
            }
            agent::daemon::run(settings).await?;
        }
        None => {
            // Default: run the agent daemon
            agent::daemon::run(settings).await?;
        }
    }

    Ok(())
}

fn main() -> Result<()> {
    utils::logging::init();

    let args = AppCli::parse();
    // Detach before any runtime threads exist.
    if args.daemon {
        run_daemon()?;
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?
        .block_on(run(args))
}
