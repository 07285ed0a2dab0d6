mod cache;
mod commands;
mod config;
mod event;
mod logging;
mod poller;
mod service;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;

use crate::cache::CacheStore;
use crate::service::{CachedClient, ServiceClient};

#[derive(Parser, Debug)]
#[command(name = "tubescript")]
#[command(about = "Transcribe videos with speaker labels using a TubeScript server")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/tubescript/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// TubeScript server URL (overrides config and TUBESCRIPT_BASE_URL)
  #[arg(long, global = true)]
  base_url: Option<String>,

  /// Also log to stderr
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: commands::Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = logging::init(args.verbose)?;

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?.with_base_url_override(args.base_url);

  let cache = CacheStore::open(&config.cache);
  let client = CachedClient::new(ServiceClient::new(&config.service)?, cache);

  let ctx = commands::Context { client, config };
  commands::run(args.command, &ctx).await
}
