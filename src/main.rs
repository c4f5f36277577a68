mod config;
mod connector;
mod protocol;
mod routecache;
mod shutdown;
mod status;
mod transport;
mod web;

use clap::{Parser, Subcommand};
use std::process::ExitCode;
use std::sync::Arc;

use crate::config::{Config, Credential};
use crate::connector::{Connector, ConnectorSettings};
use crate::routecache::RouteCache;
use crate::status::StatusReporter;

#[derive(Parser)]
#[command(name = "radar-hub")]
#[command(about = "Relay radar target tracks to a remote collection service")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the connector and the ingest API
    Run {
        #[arg(short, long, default_value = "radar-hub.yaml")]
        config: String,
    },
    /// Create or upgrade the route cache and exit
    Migrate {
        #[arg(short, long, default_value = "radar-hub.yaml")]
        config: String,
    },
    /// Print the amount of data waiting to be sent
    Stats {
        #[arg(short, long, default_value = "radar-hub.yaml")]
        config: String,
    },
    /// Validate a configuration file
    Validate {
        #[arg(short, long, default_value = "radar-hub.yaml")]
        config: String,
    },
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run(&config),
        Commands::Migrate { config } => stats(&config, "Route cache ready"),
        Commands::Stats { config } => stats(&config, "Pending"),
        Commands::Validate { config } => validate(&config),
    }
}

fn load_config(path: &str) -> Option<Config> {
    match Config::from_file(path) {
        Ok(config) => Some(config),
        Err(e) => {
            eprintln!("Error loading config {}: {}", path, e);
            None
        }
    }
}

fn open_cache(config: &Config) -> Option<RouteCache> {
    match RouteCache::init(&config.storage.database, &config.storage.migrations) {
        Ok(cache) => Some(cache),
        Err(e) => {
            eprintln!("Route cache error: {}", e);
            None
        }
    }
}

fn validate(path: &str) -> ExitCode {
    let Some(config) = load_config(path) else {
        return ExitCode::FAILURE;
    };
    println!("Configuration is valid");
    println!("  server: {}", config.server_addr());
    println!(
        "  reconnect: {:?} .. {:?}",
        config.min_reconnect_time, config.max_reconnect_time
    );
    let api_key = match config.api_key {
        Some(_) => "set",
        None => "not set",
    };
    println!("  api key: {}", api_key);
    println!("  database: {}", config.storage.database.display());
    println!("  migrations: {}", config.storage.migrations.display());
    println!("  web: {}", config.web.bind);
    ExitCode::SUCCESS
}

fn stats(path: &str, heading: &str) -> ExitCode {
    let Some(config) = load_config(path) else {
        return ExitCode::FAILURE;
    };
    let Some(cache) = open_cache(&config) else {
        return ExitCode::FAILURE;
    };

    match cache.pending_stats() {
        Ok(stats) => {
            println!(
                "{} ({}): {} unsent tracks totalling {} unsent datapoints",
                heading,
                cache.path().display(),
                stats.unsent_tracks,
                stats.unsent_datapoints
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Route cache error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(path: &str) -> ExitCode {
    let Some(config) = load_config(path) else {
        return ExitCode::FAILURE;
    };
    let Some(cache) = open_cache(&config) else {
        return ExitCode::FAILURE;
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Unable to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(serve(config, Arc::new(cache)))
}

async fn serve(config: Config, cache: Arc<RouteCache>) -> ExitCode {
    let status = StatusReporter::new(Some(Arc::new(|s: &str| log::info!("Status: {}", s))));
    let credential = Credential::new(config.api_key.clone());

    let connector = Connector::spawn(
        cache.clone(),
        ConnectorSettings::from(&config),
        credential.clone(),
        status.clone(),
    );

    let (web_trigger, web_shutdown) = shutdown::channel();
    let state = web::AppState {
        cache,
        status,
        credential,
        connector: connector.state(),
    };
    let bind = config.web.bind.clone();
    let mut server = tokio::spawn(async move {
        web::run_server(&bind, state, web_shutdown).await
    });

    let code = tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                log::error!("Unable to listen for shutdown signal: {}", e);
            }
            log::info!("Shutting down");
            ExitCode::SUCCESS
        }
        res = &mut server => {
            match res {
                Ok(Ok(())) => ExitCode::SUCCESS,
                Ok(Err(e)) => {
                    log::error!("Web server failed: {}", e);
                    ExitCode::FAILURE
                }
                Err(e) => {
                    log::error!("Web server task failed: {}", e);
                    ExitCode::FAILURE
                }
            }
        }
    };

    web_trigger.trigger();
    connector.stop().await;
    if !server.is_finished() {
        let _ = server.await;
    }
    code
}
