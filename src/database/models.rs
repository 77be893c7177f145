use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::audit::canonical::{self, parse_timestamp};
use crate::audit::entry::AuditEntry;
use crate::error::AuditError;

/// Column list shared by every entry-returning query.
pub const ENTRY_COLUMNS: &str = "seq, id, trace_id, actor_id, actor_type, action, resource, \
     resource_id, operation, outcome, severity, payload, metadata, source_ip, user_agent, \
     timestamp, created_at, schema_version, previous_hash, current_hash";

/// Raw `audit_entries` row as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EntryRow {
    pub seq: i64,
    pub id: String,
    pub trace_id: String,
    pub actor_id: String,
    pub actor_type: String,
    pub action: String,
    pub resource: String,
    pub resource_id: String,
    pub operation: String,
    pub outcome: String,
    pub severity: String,
    pub payload: String,
    pub metadata: String,
    pub source_ip: Option<String>,
    pub user_agent: Option<String>,
    pub timestamp: String,
    pub created_at: String,
    pub schema_version: i64,
    pub previous_hash: String,
    pub current_hash: String,
}

impl TryFrom<EntryRow> for AuditEntry {
    type Error = AuditError;

    fn try_from(row: EntryRow) -> Result<Self, Self::Error> {
        let corrupt = |field: &str, detail: String| {
            AuditError::Serialization(format!("Stored entry #{} has invalid {}: {}", row.seq, field, detail))
        };

        let id = Uuid::parse_str(&row.id).map_err(|e| corrupt("id", e.to_string()))?;
        let payload: Map<String, Value> = serde_json::from_str(&row.payload)
            .map_err(|e| corrupt("payload", e.to_string()))?;
        let metadata: BTreeMap<String, String> = serde_json::from_str(&row.metadata)
            .map_err(|e| corrupt("metadata", e.to_string()))?;
        let schema_version =
            u32::try_from(row.schema_version).map_err(|e| corrupt("schema_version", e.to_string()))?;

        Ok(AuditEntry {
            sequence: row.seq,
            id,
            trace_id: row.trace_id.clone(),
            actor_id: row.actor_id.clone(),
            actor_type: row.actor_type.parse()?,
            action: row.action.parse()?,
            resource: row.resource.clone(),
            resource_id: row.resource_id.clone(),
            operation: row.operation.clone(),
            outcome: row.outcome.parse()?,
            severity: row.severity.parse()?,
            payload,
            metadata,
            source_ip: row.source_ip.clone(),
            user_agent: row.user_agent.clone(),
            timestamp: parse_timestamp(&row.timestamp)?,
            created_at: parse_timestamp(&row.created_at)?,
            schema_version,
            previous_hash: row.previous_hash.clone(),
            current_hash: row.current_hash.clone(),
        })
    }
}

/// Column values for inserting an entry, in `ENTRY_COLUMNS` order minus `seq`.
pub struct NewEntryRow {
    pub id: String,
    pub payload: String,
    pub metadata: String,
    pub timestamp: String,
    pub created_at: String,
}

impl NewEntryRow {
    pub fn from_entry(entry: &AuditEntry) -> Result<Self, AuditError> {
        Ok(Self {
            id: entry.id.to_string(),
            payload: canonical::canonical_json(&Value::Object(entry.payload.clone())),
            metadata: serde_json::to_string(&entry.metadata)?,
            timestamp: canonical::format_timestamp(&entry.timestamp),
            created_at: canonical::format_timestamp(&entry.created_at),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::entry::tests::sample_entry;

    fn row_for(entry: &AuditEntry) -> EntryRow {
        let new_row = NewEntryRow::from_entry(entry).unwrap();
        EntryRow {
            seq: 1,
            id: new_row.id,
            trace_id: entry.trace_id.clone(),
            actor_id: entry.actor_id.clone(),
            actor_type: entry.actor_type.to_string(),
            action: entry.action.to_string(),
            resource: entry.resource.clone(),
            resource_id: entry.resource_id.clone(),
            operation: entry.operation.clone(),
            outcome: entry.outcome.to_string(),
            severity: entry.severity.to_string(),
            payload: new_row.payload,
            metadata: new_row.metadata,
            source_ip: entry.source_ip.clone(),
            user_agent: entry.user_agent.clone(),
            timestamp: new_row.timestamp,
            created_at: new_row.created_at,
            schema_version: entry.schema_version as i64,
            previous_hash: entry.previous_hash.clone(),
            current_hash: entry.current_hash.clone(),
        }
    }

    #[test]
    fn test_stored_row_still_verifies() {
        let entry = sample_entry();
        let restored = AuditEntry::try_from(row_for(&entry)).unwrap();
        assert_eq!(restored.sequence, 1);
        assert_eq!(restored.current_hash, entry.current_hash);
        assert!(restored.verify_hash());
    }

    #[test]
    fn test_unknown_stored_action_is_reported() {
        let entry = sample_entry();
        let mut row = row_for(&entry);
        row.action = "SOMETHING_ELSE".to_string();
        assert!(AuditEntry::try_from(row).is_err());
    }
}
