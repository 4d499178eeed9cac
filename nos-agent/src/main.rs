use std::sync::Arc;

use anyhow::Context;
use tokio::net::UnixListener;
use tracing::{error, info};

use nos_agent::config::AgentConfig;
use nos_agent::firewall::{FirewallManager, SystemNft};
use nos_agent::fstab::SystemTables;
use nos_agent::server::{self, AppState};
use nos_agent::snapshot::{SnapshotEngine, SystemHost};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // The agent is the privilege boundary; anything less than root cannot
    // perform its job and must not pretend to.
    if !nix::unistd::geteuid().is_root() {
        error!("nos-agent must run as root");
        anyhow::bail!("refusing to start: not running as root");
    }

    // Group-writable artifacts so the control plane's group can read them.
    nix::sys::stat::umask(nix::sys::stat::Mode::from_bits_truncate(0o002));

    let config = Arc::new(AgentConfig::load());
    info!(socket = %config.socket_path.display(), "starting nos-agent");

    let state = AppState {
        snapshots: Arc::new(SnapshotEngine::new(
            config.snapshot_base_dir.clone(),
            Arc::new(SystemHost),
        )),
        firewall: Arc::new(FirewallManager::new(
            config.firewall_state_dir.clone(),
            config.firewall_persist_dir.clone(),
            Arc::new(SystemNft),
        )),
        tables: Arc::new(SystemTables::new(config.etc_dir.clone())),
        config: config.clone(),
    };

    let app = server::router(state);

    if config.socket_path.exists() {
        std::fs::remove_file(&config.socket_path)
            .with_context(|| format!("removing stale socket {}", config.socket_path.display()))?;
    }
    if let Some(parent) = config.socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(&config.socket_path)
        .with_context(|| format!("binding {}", config.socket_path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(
            &config.socket_path,
            std::fs::Permissions::from_mode(0o660),
        )?;
    }

    info!("nos-agent listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("agent server failed")?;

    let _ = std::fs::remove_file(&config.socket_path);
    info!("nos-agent stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
