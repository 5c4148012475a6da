mod api;
mod authz;
mod config;
mod deploy;
mod edge;
mod git;
mod locks;
mod runtime;
mod store;

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::sync::{Arc, RwLock};
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::AgentConfig;
use deploy::Deployer;
use edge::EdgeController;
use git::Git;
use runtime::Docker;
use store::apps::AppStore;
use store::groups::GroupStore;
use store::sites::SiteStore;

#[derive(Parser)]
#[command(
    name = "siteio",
    version,
    about = "Single-node deployment agent: Docker + Traefik under a wildcard domain"
)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    let config = AgentConfig::from_env().context("invalid agent configuration")?;
    info!(
        "starting siteio agent for *.{} (data at {})",
        config.domain,
        config.data_dir.display()
    );

    let docker = Docker::new(config.data_dir.clone());
    if !docker.is_available().await {
        bail!("container runtime is not available; is the docker daemon running?");
    }

    let git = Git::new(config.data_dir.clone());
    let apps = AppStore::new(&config.data_dir);
    let sites = SiteStore::new(&config.data_dir);
    let groups = GroupStore::load(&config.data_dir).context("failed to load group store")?;

    let oauth = config::oauth::load(&config.data_dir);
    match &oauth {
        Some(_) => info!("OIDC is configured; protected resources are available"),
        None => info!("OIDC is not configured; all resources are public"),
    }
    let oauth = Arc::new(RwLock::new(oauth));

    let edge = Arc::new(EdgeController::new(config.clone(), docker.clone()));
    {
        let current_sites = sites.list()?;
        let guard = oauth.read().unwrap_or_else(|p| p.into_inner());
        edge.start(guard.as_ref(), &current_sites)
            .await
            .context("failed to start the edge controller")?;
    }

    let deployer = Deployer::new(
        config.clone(),
        docker,
        git,
        apps,
        sites,
        edge.clone(),
        oauth,
    );
    let state = Arc::new(api::AppState { deployer, groups });

    let addr = format!("0.0.0.0:{}", config.api_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("control plane listening on {}", addr);

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("control plane server failed")?;

    edge.stop().await;
    info!("agent stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", e);
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => tracing::error!("failed to install SIGTERM handler: {}", e),
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
