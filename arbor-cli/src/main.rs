use std::time::Duration;

use anyhow::Result;
use arbor_core::config::Config;
use arbor_core::logging::{init_logging_with_config, LogConfig, LogLevel};
use clap::{Parser, Subcommand};
use tracing::debug;

mod commands;

#[derive(Parser, Debug)]
#[command(name = "arbor")]
#[command(author, version, about = "Encrypted overlay network node", long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error); defaults to the config's
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON formatted logging
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a new config with freshly generated keys
    Genconf {
        /// Print JSON instead of TOML
        #[arg(long)]
        json: bool,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Print the address and subnet belonging to a config's keys
    Address {
        /// Config file
        #[arg(short, long)]
        config: String,

        #[arg(long)]
        json: bool,
    },

    /// Run a node
    Run {
        /// Config file; without one the node runs with ephemeral keys
        #[arg(short, long)]
        config: Option<String>,

        /// Extra listen address, e.g. tcp://0.0.0.0:9001
        #[arg(long)]
        listen: Vec<String>,

        /// Extra peer to keep a link to, e.g. tcp://10.0.0.1:9001
        #[arg(long)]
        peer: Vec<String>,

        /// Seconds between status log lines
        #[arg(long, default_value_t = 60)]
        status_secs: u64,
    },
}

fn init_logging(args: &Args, config: Option<&Config>) -> Result<()> {
    let mut log = match config {
        Some(config) => LogConfig::from_config(&config.logging)?,
        None => LogConfig::new(LogLevel::Info),
    };
    if let Some(raw) = &args.log_level {
        log.level = LogLevel::from_str(raw).unwrap_or_else(|| {
            eprintln!("Invalid log level '{}', using 'info'", raw);
            LogLevel::Info
        });
    }
    if args.json_logs {
        log = log.json_format(true);
    }
    init_logging_with_config(log)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match &args.command {
        Command::Genconf { json, output } => {
            init_logging(&args, None)?;
            match output {
                Some(path) => {
                    let path = commands::expand_path(path)?;
                    commands::genconf_to_file(&path)?;
                    debug!(path = %path.display(), "Config written");
                }
                None => println!("{}", commands::genconf(*json)?),
            }
        }
        Command::Address { config, json } => {
            init_logging(&args, None)?;
            let config = commands::load_config(Some(config))?;
            println!("{}", commands::address(&config, *json)?);
        }
        Command::Run {
            config,
            listen,
            peer,
            status_secs,
        } => {
            let mut config = commands::load_config(config.as_deref())?;
            config.node.listen.extend(listen.iter().cloned());
            config.node.peers.extend(peer.iter().cloned());
            init_logging(&args, Some(&config))?;
            commands::run(config, Duration::from_secs((*status_secs).max(1))).await?;
        }
    }

    Ok(())
}
