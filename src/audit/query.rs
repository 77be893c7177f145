//! Query Service
//!
//! Read-only access to committed entries. Never participates in chain
//! mutation and takes no locks beyond what the store's reads need.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audit::action::{ActorType, AuditAction, Outcome, Severity, ACTION_TAXONOMY_VERSION};
use crate::audit::canonical::CANONICAL_SCHEMA_VERSION;
use crate::audit::entry::AuditEntry;
use crate::audit::integrity::IntegrityMonitor;
use crate::config::QueryConfig;
use crate::database::LedgerStore;
use crate::error::Result;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Oldest,
    #[default]
    Newest,
}

/// Conjunction of optional equality and time-window predicates.
/// The time window applies to ledger commit time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchFilter {
    pub actor_id: Option<String>,
    pub actor_type: Option<ActorType>,
    pub action: Option<AuditAction>,
    pub resource: Option<String>,
    pub resource_id: Option<String>,
    pub trace_id: Option<String>,
    pub outcome: Option<Outcome>,
    pub severity: Option<Severity>,
    pub source_ip: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub order: SortOrder,
}

/// One-based page coordinates, already clamped to configured bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl PageRequest {
    pub fn clamped(page: Option<u32>, page_size: Option<u32>, config: &QueryConfig) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            page_size: page_size
                .unwrap_or(config.default_page_size)
                .clamp(1, config.max_page_size),
        }
    }

    pub fn offset(&self) -> i64 {
        i64::from(self.page - 1) * i64::from(self.page_size)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub entries: Vec<T>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
    pub total_pages: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrityStatus {
    Valid,
    Broken,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainSummary {
    pub total_entries: i64,
    pub first_entry_time: Option<DateTime<Utc>>,
    pub last_entry_time: Option<DateTime<Utc>>,
    pub head_hash: String,
    pub integrity_status: IntegrityStatus,
    pub integrity_checked_at: DateTime<Utc>,
    pub first_broken_id: Option<Uuid>,
    pub recent_activity_count: i64,
    pub recent_activity_window_hours: i64,
    pub schema_version: u32,
    pub taxonomy_version: u32,
}

#[derive(Clone)]
pub struct QueryService {
    store: LedgerStore,
    integrity: IntegrityMonitor,
    config: QueryConfig,
}

impl QueryService {
    pub fn new(store: LedgerStore, integrity: IntegrityMonitor, config: QueryConfig) -> Self {
        Self {
            store,
            integrity,
            config,
        }
    }

    pub fn page_request(&self, page: Option<u32>, page_size: Option<u32>) -> PageRequest {
        PageRequest::clamped(page, page_size, &self.config)
    }

    pub async fn get(&self, id: Uuid) -> Result<AuditEntry> {
        self.store.get(id).await
    }

    pub async fn by_trace(&self, trace_id: &str) -> Result<Vec<AuditEntry>> {
        self.store.by_trace(trace_id).await
    }

    pub async fn search(&self, filter: &SearchFilter, page: PageRequest) -> Result<Page<AuditEntry>> {
        let (entries, total) = self.store.search(filter, &page).await?;
        let page_size = i64::from(page.page_size);
        Ok(Page {
            entries,
            total,
            page: page.page,
            page_size: page.page_size,
            total_pages: (total + page_size - 1) / page_size,
        })
    }

    pub async fn chain_summary(&self) -> Result<ChainSummary> {
        let window = self.config.recent_activity_window_hours;
        let stats = self.store.stats(Utc::now() - Duration::hours(window)).await?;
        let head_hash = self.store.head_hash().await?;
        let integrity = self.integrity.current().await?;

        Ok(ChainSummary {
            total_entries: stats.total_entries,
            first_entry_time: stats.first_entry_time,
            last_entry_time: stats.last_entry_time,
            head_hash,
            integrity_status: if integrity.valid {
                IntegrityStatus::Valid
            } else {
                IntegrityStatus::Broken
            },
            integrity_checked_at: integrity.verified_at,
            first_broken_id: integrity.first_broken_id,
            recent_activity_count: stats.recent_activity_count,
            recent_activity_window_hours: window,
            schema_version: CANONICAL_SCHEMA_VERSION,
            taxonomy_version: ACTION_TAXONOMY_VERSION,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_request_clamping() {
        let config = QueryConfig::default();
        assert_eq!(
            PageRequest::clamped(None, None, &config),
            PageRequest { page: 1, page_size: 50 }
        );
        assert_eq!(PageRequest::clamped(Some(0), Some(0), &config).page_size, 1);
        assert_eq!(PageRequest::clamped(Some(3), Some(10_000), &config).page_size, 500);
        assert_eq!(PageRequest::clamped(Some(3), Some(20), &config).offset(), 40);
    }

    #[test]
    fn test_filter_deserializes_from_partial_json() {
        let filter: SearchFilter =
            serde_json::from_str(r#"{"action": "REVOKE_LICENSE", "severity": "critical", "order": "oldest"}"#)
                .unwrap();
        assert_eq!(filter.action, Some(AuditAction::RevokeLicense));
        assert_eq!(filter.severity, Some(Severity::Critical));
        assert_eq!(filter.order, SortOrder::Oldest);
        assert!(filter.actor_id.is_none());
    }

    #[test]
    fn test_integrity_status_wire_format() {
        assert_eq!(serde_json::to_string(&IntegrityStatus::Valid).unwrap(), "\"valid\"");
        assert_eq!(serde_json::to_string(&IntegrityStatus::Broken).unwrap(), "\"broken\"");
    }
}
