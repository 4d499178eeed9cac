//! Shared application state.

use std::sync::Arc;

use crate::agent::AgentClient;
use crate::audit::AuditLog;
use crate::auth::sessions::CookieSealer;
use crate::auth::AuthManager;
use crate::backup::destinations::DestinationStore;
use crate::backup::scheduler::BackupScheduler;
use crate::backup::BackupStore;
use crate::config::NosdConfig;
use crate::jobs::JobManager;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<NosdConfig>,
    pub auth: Arc<AuthManager>,
    pub audit: Arc<AuditLog>,
    pub jobs: Arc<JobManager>,
    pub agent: Arc<AgentClient>,
    pub backups: Arc<BackupStore>,
    pub scheduler: Arc<BackupScheduler>,
    pub destinations: Arc<DestinationStore>,
    pub sealer: Arc<CookieSealer>,
}
