use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::PollerConfig;
use crate::error::ConfigError;

#[derive(Parser, Debug)]
#[command(name = "notebook-pollers")]
#[command(version)]
#[command(about = "Follow an agent investigation's messages, executor memory and traces")]
pub struct Args {
    /// TOML config file (base_url, data_source_id, intervals, timeouts)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Base URL of the investigation API, overrides the config file
    #[arg(long, global = true)]
    pub base_url: Option<String>,

    /// Data source to route requests to, overrides the config file
    #[arg(long, global = true)]
    pub data_source_id: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Poll a top-level message until its final answer arrives
    Message {
        #[arg(long)]
        container: String,
        #[arg(long)]
        message_id: String,
    },
    /// Follow the messages of an executor memory
    Memory {
        #[arg(long)]
        container: String,
        #[arg(long)]
        executor: String,
        /// Keep polling only while this parent message has no final answer
        #[arg(long)]
        follow_message: Option<String>,
    },
    /// Accumulate and print the traces of one executor message
    Trace {
        #[arg(long)]
        container: String,
        #[arg(long)]
        executor: String,
        #[arg(long)]
        message_id: String,
        /// Parent message whose final answer completes the trace
        #[arg(long)]
        parent_message: Option<String>,
    },
}

/// Load the config file (or defaults) and apply command-line overrides.
pub fn resolve_config(args: &Args) -> Result<PollerConfig, ConfigError> {
    let mut cfg = match &args.config {
        Some(path) => PollerConfig::load(path)?,
        None => PollerConfig::default(),
    };
    if let Some(url) = &args.base_url {
        cfg.base_url = url.clone();
    }
    if let Some(id) = &args.data_source_id {
        cfg.data_source_id = Some(id.clone());
    }
    cfg.validate()?;
    Ok(cfg)
}
