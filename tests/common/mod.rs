#![allow(dead_code)]

use compliance_audit::api::AppState;
use compliance_audit::audit::{AuditEntry, AuditEntryRequest, RequestOrigin, Sequencer};
use compliance_audit::config::{AppConfig, SequencerConfig};
use compliance_audit::database::Database;
use serde_json::json;
use std::collections::BTreeMap;

/// Setup an in-memory SQLite database for testing
pub async fn setup_test_db() -> Database {
    Database::new_in_memory()
        .await
        .expect("Failed to create test database")
}

/// Sequencer tuned for heavy contention in tests
pub fn contention_config() -> SequencerConfig {
    SequencerConfig {
        max_attempts: 200,
        base_backoff_ms: 1,
        max_backoff_ms: 10,
        append_timeout_ms: 30_000,
    }
}

/// App state whose integrity cache never serves stale results
pub fn test_state(database: Database) -> AppState {
    let mut config = AppConfig::default();
    config.verification.integrity_max_age_secs = 0;
    config.verification.batch_size = 2;
    AppState::new(config, database)
}

/// Create a wallet-freeze request for an officer
pub fn freeze_request(actor: &str, wallet: &str) -> AuditEntryRequest {
    AuditEntryRequest {
        id: None,
        trace_id: format!("trace-{}", wallet),
        actor_id: actor.to_string(),
        actor_type: "user".to_string(),
        action: "FREEZE_WALLET".to_string(),
        resource: "wallet".to_string(),
        resource_id: wallet.to_string(),
        operation: "freeze".to_string(),
        outcome: "success".to_string(),
        severity: "warning".to_string(),
        payload: Some(json!({"reason": "sanctions screening hit", "amount_btc": 1.25})),
        metadata: Some(BTreeMap::from([("jurisdiction".to_string(), "EU".to_string())])),
        timestamp: None,
    }
}

/// Create a license-revocation request from a service principal
pub fn revoke_request(license: &str) -> AuditEntryRequest {
    AuditEntryRequest {
        id: None,
        trace_id: format!("trace-{}", license),
        actor_id: "licensing-svc".to_string(),
        actor_type: "service".to_string(),
        action: "REVOKE_LICENSE".to_string(),
        resource: "license".to_string(),
        resource_id: license.to_string(),
        operation: "revoke".to_string(),
        outcome: "failure".to_string(),
        severity: "critical".to_string(),
        payload: None,
        metadata: None,
        timestamp: None,
    }
}

pub fn origin(ip: &str) -> RequestOrigin {
    RequestOrigin {
        source_ip: Some(ip.to_string()),
        user_agent: Some("compliance-tests/1.0".to_string()),
    }
}

/// Append requests one after another, returning committed entries
pub async fn append_all(sequencer: &Sequencer, requests: Vec<AuditEntryRequest>) -> Vec<AuditEntry> {
    let mut entries = Vec::new();
    for request in requests {
        let receipt = sequencer
            .append(request, origin("10.1.2.3"), None)
            .await
            .expect("append failed");
        entries.push(receipt.entry);
    }
    entries
}

/// Rewrite a stored column the way an attacker with database access would
pub async fn tamper(database: &Database, id: &uuid::Uuid, column: &str, value: &str) {
    sqlx::query("DROP TRIGGER IF EXISTS audit_entries_no_update")
        .execute(database.pool())
        .await
        .expect("failed to drop trigger");
    sqlx::query(&format!("UPDATE audit_entries SET {} = ? WHERE id = ?", column))
        .bind(value)
        .bind(id.to_string())
        .execute(database.pool())
        .await
        .expect("failed to tamper");
}
