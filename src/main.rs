//! `faasd`: turns published container images into network-reachable,
//! single-request-per-container functions, driving `runc` directly with no
//! proxy in the data path. Wires together the registry, listener manager,
//! and control API described in SPEC_FULL.md; structured the way
//! `mbr-rockslide`'s `main.rs` wires its registry and reverse proxy.

mod api;
mod bundle;
mod config;
mod error;
mod handoff;
mod image;
mod lifecycle;
mod listener;
mod registry;
mod runc;
mod supervisor;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use config::Config;
use lifecycle::AddressBinder;
use listener::ListenerManager;
use registry::Registry;
use runc::Runc;
use supervisor::Supervisor;

/// Single-node FaaS control plane.
#[derive(Parser)]
#[command(name = "faasd")]
struct Cli {
    /// Path to a TOML configuration file; built-in defaults are used for
    /// any table or field it omits.
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = Config::load(cli.config).context("failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "faasd=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::debug!(?cfg, "loaded configuration");

    lifecycle::check_privileges().context("privilege check failed")?;

    let bundles_root = cfg.daemon.root_dir.join("bundles");
    let rendezvous_root = cfg.daemon.root_dir.join("rendezvous");

    let outcome = Registry::load(
        cfg.daemon.root_dir.clone(),
        &cfg.network.address_pool_cidr,
        cfg.network.container_port,
    )
    .context("failed to load deployment registry")?;
    for (name, reason) in &outcome.invalid {
        tracing::error!(deployment = %name, reason = %reason, "excluding deployment from startup recovery");
    }

    let runc = Arc::new(Runc::new(cfg.runtime.runc_path.clone()));
    let supervisor = Arc::new(Supervisor::new(
        runc,
        bundles_root.clone(),
        rendezvous_root.clone(),
        Duration::from_millis(cfg.runtime.rendezvous_timeout_ms),
        Duration::from_millis(cfg.runtime.exit_timeout_ms),
        cfg.runtime.default_memory_mib,
        cfg.runtime.cpu_quota_us,
        cfg.runtime.cpu_period_us,
    ));
    let listeners = Arc::new(ListenerManager::new(supervisor));

    let address_binder = Arc::new(AddressBinder::new(
        cfg.network.bind_interface.clone(),
        cfg.network.iface_label.clone(),
    ));

    let live_deployments = outcome.registry.list();
    lifecycle::recover(
        &live_deployments,
        &address_binder,
        &listeners,
        &bundles_root,
        &rendezvous_root,
    )
    .await
    .context("startup recovery failed")?;

    let app = api::make_router(outcome.registry, listeners.clone(), address_binder.clone())
        .layer(tower_http::trace::TraceLayer::new_for_http());

    let tcp_listener = tokio::net::TcpListener::bind(cfg.daemon.control_api_bind)
        .await
        .context("failed to bind control API listener")?;
    tracing::info!(addr = %cfg.daemon.control_api_bind, "control API listening");

    axum::serve(tcp_listener, app)
        .with_graceful_shutdown(lifecycle::wait_for_shutdown_signal())
        .await
        .context("control API server exited with error")?;

    lifecycle::shutdown(
        &listeners,
        &address_binder,
        Duration::from_millis(cfg.daemon.drain_timeout_ms),
        &bundles_root,
    )
    .await;

    Ok(())
}
