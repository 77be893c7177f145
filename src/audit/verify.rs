//! Audit Log Verification
//!
//! Walks a contiguous run of entries in append order, recomputing each
//! digest and checking linkage to its predecessor. Tampering is reported
//! as data in a [`VerificationResult`], never as an error: the first
//! divergence ends the walk because nothing after it can be anchored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::canonical;
use crate::audit::entry::AuditEntry;
use crate::database::models::EntryRow;
use crate::database::{LedgerStore, RangeStart};
use crate::error::{AuditError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainBreakKind {
    /// First entry of the ledger does not link to genesis, or a later
    /// entry claims to.
    GenesisMismatch,
    /// `previous_hash` differs from the predecessor's `current_hash`.
    LinkageMismatch,
    /// Recomputed digest differs from the stored `current_hash`.
    HashMismatch,
    /// Commit time does not strictly increase.
    OrderViolation,
    UnsupportedSchema,
    /// Stored row could not be decoded at all.
    CorruptRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainBreak {
    pub kind: ChainBreakKind,
    pub sequence: i64,
    pub entry_id: Option<Uuid>,
    pub expected: Option<String>,
    pub actual: Option<String>,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub valid: bool,
    /// Entries examined, including the broken one if any.
    pub entries_checked: u64,
    pub start_id: Option<Uuid>,
    pub first_broken_id: Option<Uuid>,
    pub failure: Option<ChainBreak>,
    /// `current_hash` of the last entry that verified.
    pub last_verified_hash: Option<String>,
    pub verified_at: DateTime<Utc>,
}

impl VerificationResult {
    pub fn summary(&self) -> String {
        match &self.failure {
            None => format!("Audit chain valid ({} entries checked)", self.entries_checked),
            Some(failure) => format!(
                "Audit chain broken at sequence {} ({:?}) after {} entries: {}",
                failure.sequence, failure.kind, self.entries_checked, failure.detail
            ),
        }
    }
}

/// Incremental chain checker; feed entries in append order.
#[derive(Debug, Clone)]
pub struct ChainWalker {
    require_genesis: bool,
    previous: Option<(String, DateTime<Utc>)>,
    start_id: Option<Uuid>,
    checked: u64,
    failure: Option<ChainBreak>,
}

impl ChainWalker {
    /// `require_genesis` is set when the first entry fed is the ledger's
    /// first; otherwise its stored `previous_hash` is accepted as the anchor.
    pub fn new(require_genesis: bool) -> Self {
        Self {
            require_genesis,
            previous: None,
            start_id: None,
            checked: 0,
            failure: None,
        }
    }

    pub fn is_broken(&self) -> bool {
        self.failure.is_some()
    }

    pub fn check_row(&mut self, row: EntryRow) -> bool {
        let sequence = row.seq;
        let raw_id = row.id.clone();
        match AuditEntry::try_from(row) {
            Ok(entry) => self.check(&entry),
            Err(err) => {
                self.checked += 1;
                let entry_id = Uuid::parse_str(&raw_id).ok();
                if self.start_id.is_none() {
                    self.start_id = entry_id;
                }
                self.fail(ChainBreak {
                    kind: ChainBreakKind::CorruptRecord,
                    sequence,
                    entry_id,
                    expected: None,
                    actual: None,
                    detail: err.to_string(),
                })
            }
        }
    }

    /// Returns `false` once the chain has broken.
    pub fn check(&mut self, entry: &AuditEntry) -> bool {
        if self.failure.is_some() {
            return false;
        }
        self.checked += 1;
        if self.start_id.is_none() {
            self.start_id = Some(entry.id);
        }

        let breaks = |kind, expected: Option<&str>, actual: Option<&str>, detail: String| ChainBreak {
            kind,
            sequence: entry.sequence,
            entry_id: Some(entry.id),
            expected: expected.map(str::to_string),
            actual: actual.map(str::to_string),
            detail,
        };

        if !canonical::is_well_formed_hash(&entry.previous_hash)
            || !canonical::is_well_formed_hash(&entry.current_hash)
        {
            return self.fail(breaks(
                ChainBreakKind::CorruptRecord,
                None,
                None,
                format!("entry {} stores a malformed hash", entry.id),
            ));
        }

        let previous_hash = self.previous.as_ref().map(|(hash, _)| hash.clone());
        match previous_hash {
            None => {
                if self.require_genesis != entry.is_genesis() {
                    let expected = if self.require_genesis { "genesis" } else { "non-genesis anchor" };
                    return self.fail(breaks(
                        ChainBreakKind::GenesisMismatch,
                        Some(expected),
                        Some(&entry.previous_hash),
                        format!("entry {} has unexpected genesis linkage", entry.id),
                    ));
                }
            }
            Some(expected) if entry.previous_hash != expected => {
                let kind = if entry.is_genesis() {
                    ChainBreakKind::GenesisMismatch
                } else {
                    ChainBreakKind::LinkageMismatch
                };
                return self.fail(breaks(
                    kind,
                    Some(&expected),
                    Some(&entry.previous_hash),
                    format!("entry {} does not link to its predecessor", entry.id),
                ));
            }
            Some(_) => {}
        }

        match canonical::compute_entry_hash(entry) {
            Ok(hash) if hash == entry.current_hash => {}
            Ok(hash) => {
                return self.fail(breaks(
                    ChainBreakKind::HashMismatch,
                    Some(&hash),
                    Some(&entry.current_hash),
                    format!("entry {} content does not match its hash", entry.id),
                ));
            }
            Err(AuditError::UnsupportedSchemaVersion(version)) => {
                return self.fail(breaks(
                    ChainBreakKind::UnsupportedSchema,
                    None,
                    Some(&version.to_string()),
                    format!("entry {} uses unknown schema version {}", entry.id, version),
                ));
            }
            Err(err) => {
                return self.fail(breaks(
                    ChainBreakKind::CorruptRecord,
                    None,
                    None,
                    err.to_string(),
                ));
            }
        }

        if let Some(previous_created_at) = self.previous.as_ref().map(|(_, at)| *at) {
            if entry.created_at <= previous_created_at {
                let detail = format!(
                    "entry {} committed at {} not after predecessor at {}",
                    entry.id, entry.created_at, previous_created_at
                );
                return self.fail(breaks(ChainBreakKind::OrderViolation, None, None, detail));
            }
        }

        self.previous = Some((entry.current_hash.clone(), entry.created_at));
        true
    }

    fn fail(&mut self, failure: ChainBreak) -> bool {
        self.failure = Some(failure);
        false
    }

    pub fn finish(self) -> VerificationResult {
        let first_broken_id = self.failure.as_ref().and_then(|f| f.entry_id);
        VerificationResult {
            valid: self.failure.is_none(),
            entries_checked: self.checked,
            start_id: self.start_id,
            first_broken_id,
            failure: self.failure,
            last_verified_hash: self.previous.map(|(hash, _)| hash),
            verified_at: Utc::now(),
        }
    }
}

/// Reads ranges from the store and verifies them batch by batch.
#[derive(Clone)]
pub struct Verifier {
    store: LedgerStore,
    batch_size: u32,
}

impl Verifier {
    pub fn new(store: LedgerStore, batch_size: u32) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    /// Verify `limit` entries (all remaining when `None`) starting at
    /// `start_id` inclusive, or at the ledger's first entry.
    pub async fn verify_range(&self, start_id: Option<Uuid>, limit: Option<u64>) -> Result<VerificationResult> {
        let (mut next_sequence, require_genesis) = match start_id {
            None => (None, true),
            Some(id) => {
                let sequence = self.store.sequence_of(id).await?;
                let first = self.store.first_sequence().await?;
                (Some(sequence), first == Some(sequence))
            }
        };

        let mut walker = ChainWalker::new(require_genesis);
        let mut remaining = limit.unwrap_or(u64::MAX);

        while remaining > 0 && !walker.is_broken() {
            let batch = remaining.min(u64::from(self.batch_size)) as u32;
            let start = match next_sequence {
                None => RangeStart::Beginning,
                Some(seq) => RangeStart::AtSequence(seq),
            };
            let rows = self.store.range_rows(start, batch).await?;
            let Some(last) = rows.last() else {
                break;
            };
            next_sequence = Some(last.seq + 1);
            let fetched = rows.len() as u64;

            for row in rows {
                if !walker.check_row(row) {
                    break;
                }
            }
            debug!("Verified batch of {} audit entries", fetched);

            remaining = remaining.saturating_sub(fetched);
            if fetched < u64::from(batch) {
                break;
            }
        }

        let result = walker.finish();
        if result.valid {
            info!("{}", result.summary());
        } else {
            warn!("{}", result.summary());
        }
        Ok(result)
    }

    /// Verify the whole ledger from genesis to the current head.
    pub async fn verify_full(&self) -> Result<VerificationResult> {
        self.verify_range(None, None).await
    }
}
