//! Process-wide application state: one explicitly constructed, `Clone`-able
//! bundle of long-lived services passed into the router, rather than
//! module-level globals.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::FromRef;

use crate::aggregator::AggregationOrchestrator;
use crate::admin_log::AdminActionLogger;
use crate::config::Config;
use crate::direct_configs::DirectConfigStore;
use crate::identity::TokenResolver;
use crate::policy::PolicyStore;
use crate::prober::Prober;
use crate::sources::SourceRegistry;
use crate::traffic::TrafficAccounting;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: sqlx::PgPool,
    pub sources: Arc<SourceRegistry>,
    pub direct_configs: Arc<DirectConfigStore>,
    pub policy: Arc<PolicyStore>,
    pub traffic: Arc<TrafficAccounting>,
    pub admin_log: Arc<AdminActionLogger>,
    pub orchestrator: Arc<AggregationOrchestrator>,
    pub prober: Arc<Prober>,
    pub identity: Arc<dyn TokenResolver>,
}

/// Lets `AdminIdentity` extract the configured bearer token straight out of
/// shared state.
impl FromRef<AppState> for String {
    fn from_ref(state: &AppState) -> String {
        state.config.admin_token.clone()
    }
}

/// Request-local connection metadata attached by `axum::serve`'s
/// `into_make_service_with_connect_info`, used as the last-resort fallback
/// in the client-IP extraction precedence.
pub type Peer = Option<SocketAddr>;
