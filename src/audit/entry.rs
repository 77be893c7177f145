//! Audit Log Entry
//!
//! Defines committed ledger entries, the ingestion request they are built
//! from, and the validated draft the sequencer seals into the chain.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::net::IpAddr;
use uuid::Uuid;

use crate::audit::action::{ActorType, AuditAction, Outcome, Severity};
use crate::audit::canonical::{self, CANONICAL_SCHEMA_VERSION, GENESIS_HASH};
use crate::error::{AuditError, Result};

const MAX_TEXT_BYTES: usize = 512;
const MAX_PAYLOAD_BYTES: usize = 64 * 1024;
const MAX_CLOCK_SKEW_SECS: i64 = 300;

/// Committed, immutable audit ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Position in append order, assigned by the store on commit.
    pub sequence: i64,
    pub id: Uuid,
    pub trace_id: String,
    pub actor_id: String,
    pub actor_type: ActorType,
    pub action: AuditAction,
    pub resource: String,
    pub resource_id: String,
    pub operation: String,
    pub outcome: Outcome,
    pub severity: Severity,
    pub payload: Map<String, Value>,
    pub metadata: BTreeMap<String, String>,
    pub source_ip: Option<String>,
    pub user_agent: Option<String>,
    /// Time reported by the producer of the event.
    pub timestamp: DateTime<Utc>,
    /// Time the ledger committed the entry.
    pub created_at: DateTime<Utc>,
    pub schema_version: u32,
    pub previous_hash: String,
    pub current_hash: String,
}

impl AuditEntry {
    pub fn is_genesis(&self) -> bool {
        self.previous_hash == GENESIS_HASH
    }

    /// Whether the stored `current_hash` matches a fresh recomputation.
    pub fn verify_hash(&self) -> bool {
        canonical::compute_entry_hash(self)
            .map(|hash| hash == self.current_hash)
            .unwrap_or(false)
    }

    pub fn summary(&self) -> String {
        format!(
            "#{} {} {} by {}:{} on {}/{} ({})",
            self.sequence,
            self.id,
            self.action,
            self.actor_type,
            self.actor_id,
            self.resource,
            self.resource_id,
            self.outcome
        )
    }
}

/// Ingestion request as delivered by HTTP handlers or the event bus.
///
/// Taxonomy fields arrive as text and are checked by [`validate`](Self::validate)
/// so unknown values surface as validation errors rather than decode failures.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditEntryRequest {
    /// Client-chosen idempotency key; generated when absent.
    pub id: Option<Uuid>,
    pub trace_id: String,
    pub actor_id: String,
    pub actor_type: String,
    pub action: String,
    pub resource: String,
    pub resource_id: String,
    pub operation: String,
    pub outcome: String,
    pub severity: String,
    pub payload: Option<Value>,
    pub metadata: Option<BTreeMap<String, String>>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Caller-derived connection details attached by the ingestion boundary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOrigin {
    pub source_ip: Option<String>,
    pub user_agent: Option<String>,
}

/// A validated request, ready to be linked into the chain.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryDraft {
    pub id: Uuid,
    pub trace_id: String,
    pub actor_id: String,
    pub actor_type: ActorType,
    pub action: AuditAction,
    pub resource: String,
    pub resource_id: String,
    pub operation: String,
    pub outcome: Outcome,
    pub severity: Severity,
    pub payload: Map<String, Value>,
    pub metadata: BTreeMap<String, String>,
    pub source_ip: Option<String>,
    pub user_agent: Option<String>,
    pub timestamp: DateTime<Utc>,
    timestamp_supplied: bool,
}

impl AuditEntryRequest {
    pub fn validate(self, origin: RequestOrigin) -> Result<EntryDraft> {
        let trace_id = required_text("trace_id", self.trace_id)?;
        let actor_id = required_text("actor_id", self.actor_id)?;
        let resource = required_text("resource", self.resource)?;
        let resource_id = required_text("resource_id", self.resource_id)?;
        let operation = required_text("operation", self.operation)?;

        let actor_type: ActorType = required_text("actor_type", self.actor_type)?.parse()?;
        let action: AuditAction = required_text("action", self.action)?.parse()?;
        let outcome: Outcome = required_text("outcome", self.outcome)?.parse()?;
        let severity: Severity = required_text("severity", self.severity)?.parse()?;

        let payload = match self.payload {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map,
            Some(_) => return Err(AuditError::validation("payload", "must be a JSON object")),
        };
        let payload_len = canonical::canonical_json(&Value::Object(payload.clone())).len();
        if payload_len > MAX_PAYLOAD_BYTES {
            return Err(AuditError::validation(
                "payload",
                format!("{} bytes exceeds limit of {}", payload_len, MAX_PAYLOAD_BYTES),
            ));
        }

        let metadata = self.metadata.unwrap_or_default();
        for (key, value) in &metadata {
            if key.trim().is_empty() {
                return Err(AuditError::validation("metadata", "keys must not be blank"));
            }
            if key.len() > MAX_TEXT_BYTES || value.len() > MAX_TEXT_BYTES {
                return Err(AuditError::validation(
                    "metadata",
                    format!("entry '{}' exceeds {} bytes", key, MAX_TEXT_BYTES),
                ));
            }
        }

        let source_ip = match origin.source_ip {
            Some(ip) => {
                let parsed: IpAddr = ip
                    .trim()
                    .parse()
                    .map_err(|_| AuditError::validation("source_ip", format!("'{}' is not an IP address", ip)))?;
                Some(parsed.to_string())
            }
            None => None,
        };
        let user_agent = origin.user_agent.map(|ua| truncate_utf8(ua, MAX_TEXT_BYTES));

        let now = Utc::now();
        let timestamp_supplied = self.timestamp.is_some();
        let timestamp = canonical::truncate_to_micros(self.timestamp.unwrap_or(now));
        if timestamp > now + Duration::seconds(MAX_CLOCK_SKEW_SECS) {
            return Err(AuditError::validation(
                "timestamp",
                format!("{} is too far in the future", timestamp),
            ));
        }

        Ok(EntryDraft {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            trace_id,
            actor_id,
            actor_type,
            action,
            resource,
            resource_id,
            operation,
            outcome,
            severity,
            payload,
            metadata,
            source_ip,
            user_agent,
            timestamp,
            timestamp_supplied,
        })
    }
}

impl EntryDraft {
    /// Link the draft to `previous_hash` and compute its digest.
    ///
    /// The returned entry has `sequence == 0` until the store commits it.
    pub fn seal(&self, previous_hash: &str, created_at: DateTime<Utc>) -> Result<AuditEntry> {
        let mut entry = AuditEntry {
            sequence: 0,
            id: self.id,
            trace_id: self.trace_id.clone(),
            actor_id: self.actor_id.clone(),
            actor_type: self.actor_type,
            action: self.action,
            resource: self.resource.clone(),
            resource_id: self.resource_id.clone(),
            operation: self.operation.clone(),
            outcome: self.outcome,
            severity: self.severity,
            payload: self.payload.clone(),
            metadata: self.metadata.clone(),
            source_ip: self.source_ip.clone(),
            user_agent: self.user_agent.clone(),
            timestamp: self.timestamp,
            created_at: canonical::truncate_to_micros(created_at),
            schema_version: CANONICAL_SCHEMA_VERSION,
            previous_hash: previous_hash.to_string(),
            current_hash: String::new(),
        };
        entry.current_hash = canonical::compute_entry_hash(&entry)?;
        Ok(entry)
    }

    /// Whether an already-committed entry records the same event.
    ///
    /// Connection details are ignored since a retry may arrive via a
    /// different hop.
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.id == entry.id
            && self.trace_id == entry.trace_id
            && self.actor_id == entry.actor_id
            && self.actor_type == entry.actor_type
            && self.action == entry.action
            && self.resource == entry.resource
            && self.resource_id == entry.resource_id
            && self.operation == entry.operation
            && self.outcome == entry.outcome
            && self.severity == entry.severity
            && self.payload == entry.payload
            && self.metadata == entry.metadata
            && (!self.timestamp_supplied || self.timestamp == entry.timestamp)
    }
}

fn required_text(field: &str, value: String) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AuditError::validation(field, "must not be blank"));
    }
    if trimmed.len() > MAX_TEXT_BYTES {
        return Err(AuditError::validation(
            field,
            format!("exceeds {} bytes", MAX_TEXT_BYTES),
        ));
    }
    Ok(trimmed.to_string())
}

fn truncate_utf8(mut value: String, max: usize) -> String {
    if value.len() > max {
        let mut cut = max;
        while !value.is_char_boundary(cut) {
            cut -= 1;
        }
        value.truncate(cut);
    }
    value
}
