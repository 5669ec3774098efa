use std::path::PathBuf;

use ::tracing::error;
use clap::Parser;
use service::Service;

mod config;
mod http_objects;
mod node_manager;
mod reconciler;
mod routes;
mod scheduler;
mod service;
mod tracing;
use tracing::setup_tracing;

#[cfg(test)]
mod testing;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,
    #[arg(long, help = "Print the effective configuration as YAML and exit")]
    dump_config: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match cli.config {
        Some(path) => match config::ServerConfig::from_path(path.to_str().unwrap_or_default()) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("error loading config: {:#}", err);
                return;
            }
        },
        None => config::ServerConfig::default(),
    };

    if cli.dump_config {
        match serde_yaml::to_string(&config) {
            Ok(yaml) => print!("{}", yaml),
            Err(err) => eprintln!("error serializing config: {:#}", err),
        }
        return;
    }

    if let Err(err) = setup_tracing(&config) {
        eprintln!("error setting up tracing: {:#}", err);
        return;
    }

    let service = Service::new(config).await;
    match service {
        Ok(mut service) => {
            if let Err(err) = service.start().await {
                error!("error starting service: {:?}", err);
            }
        }
        Err(err) => error!("error creating service: {:?}", err),
    }
}
