//! Ledger Store
//!
//! Append-only persistence for audit entries. The only mutating operation
//! is [`LedgerStore::append_if_head_matches`], a single conditional
//! `INSERT ... SELECT ... WHERE` statement: SQLite executes it under one
//! write lock, so reading the head and inserting the successor cannot be
//! interleaved with another writer.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::{QueryBuilder, Sqlite};
use tracing::debug;
use uuid::Uuid;

use crate::audit::canonical::{self, GENESIS_HASH};
use crate::audit::entry::AuditEntry;
use crate::audit::query::{PageRequest, SearchFilter, SortOrder};
use crate::database::models::{EntryRow, NewEntryRow, ENTRY_COLUMNS};
use crate::error::{AuditError, Result};

/// Most recently committed entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainHead {
    pub sequence: i64,
    pub hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    /// Committed; carries the entry with its assigned sequence.
    Appended(AuditEntry),
    /// Another writer advanced the head first.
    HeadMoved,
    /// An entry with this id already exists.
    DuplicateId,
}

/// Where a range read begins. All variants read forward in append order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RangeStart {
    Beginning,
    /// Inclusive of the entry with this sequence.
    AtSequence(i64),
    AfterId(Uuid),
    AfterTime(DateTime<Utc>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LedgerStats {
    pub total_entries: i64,
    pub first_entry_time: Option<DateTime<Utc>>,
    pub last_entry_time: Option<DateTime<Utc>>,
    pub recent_activity_count: i64,
}

#[derive(Clone)]
pub struct LedgerStore {
    pool: SqlitePool,
}

impl LedgerStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn head(&self) -> Result<Option<ChainHead>> {
        let row: Option<(i64, String, String)> = sqlx::query_as(
            "SELECT seq, current_hash, created_at FROM audit_entries ORDER BY seq DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((sequence, hash, created_at)) => Ok(Some(ChainHead {
                sequence,
                hash,
                created_at: canonical::parse_timestamp(&created_at)?,
            })),
            None => Ok(None),
        }
    }

    /// Hash the next entry must link to.
    pub async fn head_hash(&self) -> Result<String> {
        Ok(self
            .head()
            .await?
            .map(|head| head.hash)
            .unwrap_or_else(|| GENESIS_HASH.to_string()))
    }

    /// Insert `entry` as the new head only if the current head is still
    /// `expected_head` (or the ledger is empty and `expected_head` is the
    /// genesis sentinel).
    pub async fn append_if_head_matches(
        &self,
        entry: &AuditEntry,
        expected_head: &str,
    ) -> Result<AppendOutcome> {
        if entry.previous_hash != expected_head {
            return Err(AuditError::Validation(format!(
                "entry {} links to {} but expected head is {}",
                entry.id, entry.previous_hash, expected_head
            )));
        }
        if !entry.verify_hash() {
            return Err(AuditError::Validation(format!(
                "entry {} does not carry its own digest",
                entry.id
            )));
        }

        let row = NewEntryRow::from_entry(entry)?;
        let result = sqlx::query(
            r#"
            INSERT INTO audit_entries
                (id, trace_id, actor_id, actor_type, action, resource, resource_id, operation,
                 outcome, severity, payload, metadata, source_ip, user_agent, timestamp,
                 created_at, schema_version, previous_hash, current_hash)
            SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?
            WHERE COALESCE(
                (SELECT current_hash FROM audit_entries ORDER BY seq DESC LIMIT 1),
                ?
            ) = ?
            "#,
        )
        .bind(&row.id)
        .bind(&entry.trace_id)
        .bind(&entry.actor_id)
        .bind(entry.actor_type.as_str())
        .bind(entry.action.as_str())
        .bind(&entry.resource)
        .bind(&entry.resource_id)
        .bind(&entry.operation)
        .bind(entry.outcome.as_str())
        .bind(entry.severity.as_str())
        .bind(&row.payload)
        .bind(&row.metadata)
        .bind(&entry.source_ip)
        .bind(&entry.user_agent)
        .bind(&row.timestamp)
        .bind(&row.created_at)
        .bind(entry.schema_version as i64)
        .bind(&entry.previous_hash)
        .bind(&entry.current_hash)
        .bind(GENESIS_HASH)
        .bind(expected_head)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 1 => {
                let mut committed = entry.clone();
                committed.sequence = done.last_insert_rowid();
                debug!("Committed audit entry {} at sequence {}", committed.id, committed.sequence);
                Ok(AppendOutcome::Appended(committed))
            }
            Ok(_) => Ok(AppendOutcome::HeadMoved),
            Err(err) => classify_append_error(err),
        }
    }

    pub async fn find(&self, id: Uuid) -> Result<Option<AuditEntry>> {
        let row: Option<EntryRow> = sqlx::query_as(&format!(
            "SELECT {} FROM audit_entries WHERE id = ?",
            ENTRY_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(AuditEntry::try_from).transpose()
    }

    pub async fn get(&self, id: Uuid) -> Result<AuditEntry> {
        self.find(id)
            .await?
            .ok_or_else(|| AuditError::entry_not_found(id))
    }

    pub async fn sequence_of(&self, id: Uuid) -> Result<i64> {
        let seq: Option<i64> = sqlx::query_scalar("SELECT seq FROM audit_entries WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        seq.ok_or_else(|| AuditError::entry_not_found(id))
    }

    pub async fn first_sequence(&self) -> Result<Option<i64>> {
        let seq: Option<i64> = sqlx::query_scalar("SELECT MIN(seq) FROM audit_entries")
            .fetch_one(&self.pool)
            .await?;
        Ok(seq)
    }

    /// Raw rows in append order, without decoding. Verification reads
    /// through this so an undecodable row is reported, not raised.
    pub async fn range_rows(&self, start: RangeStart, limit: u32) -> Result<Vec<EntryRow>> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM audit_entries WHERE ", ENTRY_COLUMNS));
        match start {
            RangeStart::Beginning => {
                qb.push("1 = 1");
            }
            RangeStart::AtSequence(seq) => {
                qb.push("seq >= ").push_bind(seq);
            }
            RangeStart::AfterId(id) => {
                let seq = self.sequence_of(id).await?;
                qb.push("seq > ").push_bind(seq);
            }
            RangeStart::AfterTime(time) => {
                qb.push("created_at > ").push_bind(canonical::format_timestamp(&time));
            }
        }
        qb.push(" ORDER BY seq ASC LIMIT ").push_bind(i64::from(limit));

        let rows = qb.build_query_as::<EntryRow>().fetch_all(&self.pool).await?;
        Ok(rows)
    }

    pub async fn range(&self, start: RangeStart, limit: u32) -> Result<Vec<AuditEntry>> {
        self.range_rows(start, limit)
            .await?
            .into_iter()
            .map(AuditEntry::try_from)
            .collect()
    }

    pub async fn by_trace(&self, trace_id: &str) -> Result<Vec<AuditEntry>> {
        let rows: Vec<EntryRow> = sqlx::query_as(&format!(
            "SELECT {} FROM audit_entries WHERE trace_id = ? ORDER BY seq ASC",
            ENTRY_COLUMNS
        ))
        .bind(trace_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AuditEntry::try_from).collect()
    }

    /// Filtered page of entries plus the total number of matches.
    pub async fn search(&self, filter: &SearchFilter, page: &PageRequest) -> Result<(Vec<AuditEntry>, i64)> {
        let mut count_qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM audit_entries WHERE 1 = 1");
        push_filters(&mut count_qb, filter);
        let total: i64 = count_qb.build_query_scalar().fetch_one(&self.pool).await?;

        let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM audit_entries WHERE 1 = 1", ENTRY_COLUMNS));
        push_filters(&mut qb, filter);
        qb.push(match filter.order {
            SortOrder::Oldest => " ORDER BY seq ASC",
            SortOrder::Newest => " ORDER BY seq DESC",
        });
        qb.push(" LIMIT ")
            .push_bind(i64::from(page.page_size))
            .push(" OFFSET ")
            .push_bind(page.offset());

        let rows = qb.build_query_as::<EntryRow>().fetch_all(&self.pool).await?;
        let entries = rows
            .into_iter()
            .map(AuditEntry::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok((entries, total))
    }

    pub async fn stats(&self, recent_since: DateTime<Utc>) -> Result<LedgerStats> {
        let (total_entries, first, last): (i64, Option<String>, Option<String>) = sqlx::query_as(
            "SELECT COUNT(*), MIN(created_at), MAX(created_at) FROM audit_entries",
        )
        .fetch_one(&self.pool)
        .await?;

        let recent_activity_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM audit_entries WHERE created_at >= ?")
                .bind(canonical::format_timestamp(&recent_since))
                .fetch_one(&self.pool)
                .await?;

        Ok(LedgerStats {
            total_entries,
            first_entry_time: first.as_deref().map(canonical::parse_timestamp).transpose()?,
            last_entry_time: last.as_deref().map(canonical::parse_timestamp).transpose()?,
            recent_activity_count,
        })
    }
}

fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, filter: &SearchFilter) {
    if let Some(actor_id) = &filter.actor_id {
        qb.push(" AND actor_id = ").push_bind(actor_id.clone());
    }
    if let Some(actor_type) = filter.actor_type {
        qb.push(" AND actor_type = ").push_bind(actor_type.as_str());
    }
    if let Some(action) = filter.action {
        qb.push(" AND action = ").push_bind(action.as_str());
    }
    if let Some(resource) = &filter.resource {
        qb.push(" AND resource = ").push_bind(resource.clone());
    }
    if let Some(resource_id) = &filter.resource_id {
        qb.push(" AND resource_id = ").push_bind(resource_id.clone());
    }
    if let Some(trace_id) = &filter.trace_id {
        qb.push(" AND trace_id = ").push_bind(trace_id.clone());
    }
    if let Some(outcome) = filter.outcome {
        qb.push(" AND outcome = ").push_bind(outcome.as_str());
    }
    if let Some(severity) = filter.severity {
        qb.push(" AND severity = ").push_bind(severity.as_str());
    }
    if let Some(source_ip) = &filter.source_ip {
        qb.push(" AND source_ip = ").push_bind(source_ip.clone());
    }
    if let Some(from) = filter.from {
        qb.push(" AND created_at >= ").push_bind(canonical::format_timestamp(&from));
    }
    if let Some(to) = filter.to {
        qb.push(" AND created_at <= ").push_bind(canonical::format_timestamp(&to));
    }
}

// SQLite primary result codes for lock contention.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

fn classify_append_error(err: sqlx::Error) -> Result<AppendOutcome> {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            let message = db_err.message();
            if message.contains("audit_entries.id") {
                return Ok(AppendOutcome::DuplicateId);
            }
            if message.contains("audit_entries.previous_hash") {
                return Ok(AppendOutcome::HeadMoved);
            }
        }

        let primary = db_err
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .map(|code| code & 0xff);
        if matches!(primary, Some(SQLITE_BUSY) | Some(SQLITE_LOCKED)) {
            return Err(AuditError::HeadConflict);
        }
    }
    Err(err.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::entry::tests::sample_request;
    use crate::audit::entry::RequestOrigin;
    use crate::database::Database;
    use chrono::Duration;

    async fn store() -> LedgerStore {
        Database::new_in_memory().await.unwrap().ledger()
    }

    fn draft_entry(previous_hash: &str, created_at: DateTime<Utc>) -> AuditEntry {
        sample_request()
            .validate(RequestOrigin::default())
            .unwrap()
            .seal(previous_hash, created_at)
            .unwrap()
    }

    #[tokio::test]
    async fn test_empty_ledger_head_is_genesis() {
        let store = store().await;
        assert!(store.head().await.unwrap().is_none());
        assert_eq!(store.head_hash().await.unwrap(), GENESIS_HASH);
        assert_eq!(store.first_sequence().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_append_advances_head() {
        let store = store().await;
        let entry = draft_entry(GENESIS_HASH, Utc::now());

        let outcome = store.append_if_head_matches(&entry, GENESIS_HASH).await.unwrap();
        let committed = match outcome {
            AppendOutcome::Appended(e) => e,
            other => panic!("unexpected outcome {:?}", other),
        };

        assert_eq!(committed.sequence, 1);
        let head = store.head().await.unwrap().unwrap();
        assert_eq!(head.hash, entry.current_hash);
        assert_eq!(store.get(entry.id).await.unwrap(), committed);
    }

    #[tokio::test]
    async fn test_stale_head_is_rejected() {
        let store = store().await;
        let first = draft_entry(GENESIS_HASH, Utc::now());
        store.append_if_head_matches(&first, GENESIS_HASH).await.unwrap();

        // A second writer that still believes the ledger is empty.
        let stale = draft_entry(GENESIS_HASH, Utc::now());
        let outcome = store.append_if_head_matches(&stale, GENESIS_HASH).await.unwrap();
        assert_eq!(outcome, AppendOutcome::HeadMoved);

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM audit_entries")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn test_duplicate_id_detected() {
        let store = store().await;
        let first = draft_entry(GENESIS_HASH, Utc::now());
        store.append_if_head_matches(&first, GENESIS_HASH).await.unwrap();

        let mut copy = first.clone();
        copy.previous_hash = first.current_hash.clone();
        copy.created_at = first.created_at + Duration::microseconds(1);
        copy.current_hash = canonical::compute_entry_hash(&copy).unwrap();

        let outcome = store.append_if_head_matches(&copy, &first.current_hash).await.unwrap();
        assert_eq!(outcome, AppendOutcome::DuplicateId);
    }

    #[tokio::test]
    async fn test_mismatched_linkage_is_refused() {
        let store = store().await;
        let entry = draft_entry(GENESIS_HASH, Utc::now());
        let err = store
            .append_if_head_matches(&entry, &"a".repeat(64))
            .await
            .unwrap_err();
        assert!(matches!(err, AuditError::Validation(_)));
    }

    #[tokio::test]
    async fn test_unsealed_entry_is_refused() {
        let store = store().await;
        let mut entry = draft_entry(GENESIS_HASH, Utc::now());
        entry.operation = "unfreeze".to_string();

        let err = store.append_if_head_matches(&entry, GENESIS_HASH).await.unwrap_err();
        assert!(matches!(err, AuditError::Validation(_)));
        assert_eq!(store.head_hash().await.unwrap(), GENESIS_HASH);
    }

    #[tokio::test]
    async fn test_rows_are_immutable() {
        let store = store().await;
        let entry = draft_entry(GENESIS_HASH, Utc::now());
        store.append_if_head_matches(&entry, GENESIS_HASH).await.unwrap();

        let update = sqlx::query("UPDATE audit_entries SET outcome = 'failure'")
            .execute(&store.pool)
            .await;
        assert!(update.is_err());

        let delete = sqlx::query("DELETE FROM audit_entries").execute(&store.pool).await;
        assert!(delete.is_err());
    }

    #[tokio::test]
    async fn test_range_after_unknown_id_is_not_found() {
        let store = store().await;
        let err = store
            .range(RangeStart::AfterId(Uuid::new_v4()), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, AuditError::NotFound(_)));
    }
}
