use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use nosd::agent::AgentClient;
use nosd::audit::AuditLog;
use nosd::auth::policy::PasswordPolicy;
use nosd::auth::ratelimit::LoginRateLimiter;
use nosd::auth::sessions::{CookieSealer, SessionStore};
use nosd::auth::store::{LockoutStore, ResetTokenStore, Role, TotpStore, UserStore};
use nosd::auth::AuthManager;
use nosd::backup::destinations::DestinationStore;
use nosd::backup::scheduler::BackupScheduler;
use nosd::backup::BackupStore;
use nosd::config::NosdConfig;
use nosd::jobs::JobManager;
use nosd::server;
use nosd::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(NosdConfig::load());

    // A control plane that cannot persist state must not come up at all.
    if let Err(e) = config.ensure_writable() {
        eprintln!("nosd: {}", e);
        anyhow::bail!("refusing to start: {}", e);
    }

    // Stdout plus a daily-rolled process log (separate from the audit log).
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    let file_appender =
        tracing_appender::rolling::daily(config.data_dir.join("logs"), "nosd.log");
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    info!(data_dir = %config.data_dir.display(), "starting nosd");

    let data_dir = config.data_dir.clone();
    let audit = Arc::new(AuditLog::new(config.audit_dir()).context("opening audit log")?);
    let users = Arc::new(UserStore::open(&data_dir).context("opening user store")?);
    let sessions = Arc::new(
        SessionStore::open(&data_dir, config.session_hours, config.elevation_minutes)
            .context("opening session store")?,
    );
    let auth = Arc::new(AuthManager {
        users: users.clone(),
        sessions,
        totp: Arc::new(TotpStore::open(&data_dir)?),
        reset_tokens: Arc::new(ResetTokenStore::open(&data_dir)?),
        lockouts: Arc::new(LockoutStore::open(&data_dir)?),
        limiter: Arc::new(LoginRateLimiter::new()),
        audit: audit.clone(),
        policy: PasswordPolicy::default(),
    });

    seed_admin(&auth).await?;

    let agent = Arc::new(AgentClient::new(config.agent_socket.clone()));
    match agent.health().await {
        Ok(_) => info!("agent reachable"),
        Err(e) => warn!("agent not reachable yet: {}", e),
    }

    let jobs = Arc::new(JobManager::new());
    let backups = Arc::new(BackupStore::open(&data_dir).context("opening backup store")?);
    let destinations = Arc::new(
        DestinationStore::open(&data_dir, config.keys_dir()).context("opening destinations")?,
    );
    let scheduler = Arc::new(BackupScheduler::new(
        backups.clone(),
        jobs.clone(),
        agent.clone(),
        audit.clone(),
    ));
    scheduler.clone().start();
    info!("backup scheduler started");

    // Hourly housekeeper: session/token/lockout sweep, audit rotation and
    // retention, completed-job pruning.
    {
        let auth = auth.clone();
        let audit = audit.clone();
        let jobs = jobs.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(3600));
            loop {
                interval.tick().await;
                auth.sweep().await;
                audit.housekeep();
                jobs.prune_completed(chrono::Duration::days(7));
            }
        });
    }
    info!("housekeeping started");

    let sealer = Arc::new(CookieSealer::open(&data_dir).context("opening cookie sealer")?);
    let state = AppState {
        config: config.clone(),
        auth,
        audit,
        jobs,
        agent,
        backups,
        scheduler,
        destinations,
        sealer,
    };

    let app = server::router(state);
    let listener = tokio::net::TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;
    info!(listen = %config.listen, "nosd listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server failed")?;

    info!("nosd stopped");
    Ok(())
}

/// First boot: create an admin account with a forced password change.
async fn seed_admin(auth: &AuthManager) -> anyhow::Result<()> {
    if !auth.users.is_empty().await {
        return Ok(());
    }

    let password = match std::env::var("NOS_ADMIN_PASSWORD") {
        Ok(p) if !p.is_empty() => p,
        _ => {
            use rand::RngCore;
            let mut bytes = [0u8; 9];
            rand::thread_rng().fill_bytes(&mut bytes);
            let generated = format!("Nos-{}", hex::encode(bytes));
            warn!("no NOS_ADMIN_PASSWORD set, generated initial admin password: {}", generated);
            generated
        }
    };

    let hash = nosd::auth::password::hash_password(&password)
        .map_err(|e| anyhow::anyhow!("hashing admin password: {}", e))?;
    auth.users
        .create("admin", None, Role::Admin, hash, true)
        .await
        .map_err(|e| anyhow::anyhow!("creating admin user: {}", e))?;
    info!("created initial admin user (password change required on first login)");
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
