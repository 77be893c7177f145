//! HTTP surface over the audit core.

pub mod extract;
pub mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::audit::{IntegrityMonitor, QueryService, Sequencer, Verifier};
use crate::config::AppConfig;
use crate::database::Database;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub database: Database,
    pub sequencer: Sequencer,
    pub verifier: Verifier,
    pub integrity: IntegrityMonitor,
    pub query: QueryService,
}

impl AppState {
    pub fn new(config: AppConfig, database: Database) -> Self {
        let ledger = database.ledger();
        let verifier = Verifier::new(ledger.clone(), config.verification.batch_size);
        let integrity = IntegrityMonitor::new(verifier.clone(), config.verification.integrity_max_age());
        let query = QueryService::new(ledger.clone(), integrity.clone(), config.query.clone());
        let sequencer = Sequencer::new(ledger, config.sequencer.clone());

        Self {
            config: Arc::new(config),
            database,
            sequencer,
            verifier,
            integrity,
            query,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/entries", post(handlers::append_entry).get(handlers::entries_by_trace))
        .route("/entries/:id", get(handlers::get_entry))
        .route("/search", post(handlers::search_entries))
        .route("/chain/summary", get(handlers::chain_summary))
        .route("/chain/verify", post(handlers::verify_chain))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).into_inner())
        .with_state(state)
}
