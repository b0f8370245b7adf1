//! OVN daemon binary
//!
//! Loads configuration and runs the top-level node instance.

use clap::Parser;
use ovn::{Config, Node};
use std::path::PathBuf;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, EnvFilter};

/// Overlay virtual network daemon
#[derive(Parser, Debug)]
#[command(name = "ovnd", version, about)]
struct Args {
    /// Path to configuration file (overrides default search paths)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

fn main() {
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();

    info!("ovnd starting");

    let (config, loaded_paths) = if let Some(config_path) = &args.config {
        match Config::load_file(config_path) {
            Ok(config) => (config, vec![config_path.clone()]),
            Err(e) => {
                error!(
                    "failed to load configuration from {}: {}",
                    config_path.display(),
                    e
                );
                std::process::exit(1);
            }
        }
    } else {
        match Config::load() {
            Ok(result) => result,
            Err(e) => {
                error!("failed to load configuration: {}", e);
                std::process::exit(1);
            }
        }
    };

    if loaded_paths.is_empty() {
        info!("no config files found, using defaults");
    } else {
        for path in &loaded_paths {
            info!(path = %path.display(), "loaded config file");
        }
    }

    if config.has_identity() {
        info!("using configured identity");
    } else {
        warn!("no identity configured, generating ephemeral keypair");
    }

    let mut node = match Node::new(config) {
        Ok(node) => node,
        Err(e) => {
            error!("failed to create node: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = node.start() {
        error!("failed to start node: {}", e);
        std::process::exit(1);
    }

    // Worker and housekeeping threads carry the node from here.
    loop {
        std::thread::park();
    }
}
