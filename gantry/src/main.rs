#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand};
use gantry_core::{GantryError, Result, Service, ServiceContainer};
use gantry_gateway::{GatewayServer, UpstreamConfig, UpstreamPool};
use gantry_hall::{EchoHandler, HallConfig, HallService};
use gantry_registry::{RegisterOptions, Registry, RegistryConfig};
use gantry_store::{EtcdStore, KvStore, MemStore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "gantry")]
#[command(about = "Game-server coordination plane: registries, gateway and hall")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write a default config for the chosen role and exit.
    #[arg(long, value_name = "PATH")]
    gen_config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a gateway: accept clients, forward sessions to halls.
    Gateway,
    /// Run a hall: serve sessions, own users.
    Hall,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let role = match args.command {
        Command::Gateway => "gateway",
        Command::Hall => "hall",
    };

    if let Some(path) = &args.gen_config {
        if let Err(err) = generate_config(path, role) {
            eprintln!("failed to generate config: {err}");
            std::process::exit(1);
        }
        println!("generated default config at: {}", path.display());
        return;
    }

    init_tracing();

    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(err) => {
                error!(target: "gantry", error = %err, path = %path.display(), "config load failed");
                std::process::exit(1);
            }
        },
        None => Config::example(role),
    };

    let result = match args.command {
        Command::Gateway => run_gateway(config).await,
        Command::Hall => run_hall(config).await,
    };
    if let Err(err) = result {
        error!(target: "gantry", error = %err, "exited with error");
        std::process::exit(1);
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn generate_config(path: &std::path::Path, role: &str) -> Result<()> {
    let rendered = toml::to_string_pretty(&Config::example(role))
        .map_err(|err| GantryError::Internal(err.to_string()))?;
    std::fs::write(path, rendered)?;
    Ok(())
}

async fn build_store(config: &Config) -> Result<Arc<dyn KvStore>> {
    match config.store.mode.as_str() {
        "memory" => {
            info!(target: "gantry", "using in-process store");
            Ok(Arc::new(MemStore::new()))
        }
        "etcd" => {
            info!(target: "gantry", endpoints = ?config.store.endpoints, "connecting to etcd");
            Ok(Arc::new(EtcdStore::connect(&config.store.endpoints).await?))
        }
        other => Err(GantryError::Internal(format!("unknown store mode {other}"))),
    }
}

async fn start_registry(
    config: &Config,
    store: Arc<dyn KvStore>,
    root: &CancellationToken,
) -> Result<Arc<Registry>> {
    let mut registry_config = RegistryConfig::new(
        &config.peer.peer_type,
        config.peer.id,
        &config.peer.address,
    );
    registry_config.lease_ttl_secs = config.peer.lease_ttl_secs;
    Registry::start(store, registry_config, root).await
}

async fn run_gateway(config: Config) -> Result<()> {
    let root = CancellationToken::new();
    let store = build_store(&config).await?;
    let registry = start_registry(&config, store, &root).await?;

    let mut upstream_config = UpstreamConfig::new(
        &config.gateway.hall_type,
        &registry.self_peer().full_name,
    );
    upstream_config.heartbeat_interval =
        Duration::from_secs(config.gateway.heartbeat_interval_secs.max(1));
    upstream_config.connect_timeout =
        Duration::from_secs(config.gateway.connect_timeout_secs.max(1));
    let pool = UpstreamPool::new(upstream_config, registry.token());
    registry.add_peer_handler(pool.clone());

    let server = GatewayServer::new(pool, registry.token());
    let listener = GatewayServer::bind(&config.gateway.listen_addr).await?;

    let serve = tokio::spawn(server.clone().serve(listener));
    shutdown_signal().await;
    info!(target: "gantry", "shutting down gateway");
    registry.stop().await;
    let _ = serve.await;
    Ok(())
}

async fn run_hall(config: Config) -> Result<()> {
    let root = CancellationToken::new();
    let store = build_store(&config).await?;
    let registry = start_registry(&config, store, &root).await?;

    let build_time = if config.hall.build_time != 0 {
        config.hall.build_time
    } else {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs() as i64)
    };
    let hall = HallService::new(
        registry.clone(),
        HallConfig {
            listen_addr: config.hall.listen_addr.clone(),
            build_time,
            app_version: config.hall.app_version.clone(),
        },
        Arc::new(EchoHandler),
    );

    let container = ServiceContainer::new(registry.token());
    let svc: Arc<dyn Service> = hall;
    container.start_service("hall", svc).await?;

    registry
        .register_service(
            &config.hall.service_name,
            RegisterOptions {
                as_app_service: config.hall.as_app_service,
            },
        )
        .await?;

    shutdown_signal().await;
    info!(target: "gantry", "shutting down hall");
    registry.stop().await;
    container.stop().await
}

#[allow(clippy::expect_used)] // Signal handlers are startup-critical; abort is correct on failure.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        tokio::select! {
            _ = sigterm.recv() => {
                info!(target: "gantry", "SIGTERM received");
            }
            _ = sigint.recv() => {
                info!(target: "gantry", "SIGINT received");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!(target: "gantry", "ctrl-c received");
    }
}
