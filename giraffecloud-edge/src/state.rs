//! Shared application state passed to all subsystems.

use std::sync::Arc;

use crate::api::auth::Authorizer;
use crate::audit::AuditSink;
use crate::config::Config;
use crate::dispatch::classify::Classifier;
use crate::quota::QuotaService;
use crate::registry::TunnelRegistry;
use crate::store::Store;
use crate::usage::UsageTracker;

pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub registry: Arc<TunnelRegistry>,
    pub usage: Arc<UsageTracker>,
    pub quota: Arc<QuotaService>,
    pub authorizer: Arc<dyn Authorizer>,
    pub audit: Arc<dyn AuditSink>,
    pub classifier: Classifier,
}
