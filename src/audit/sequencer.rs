//! Sequencer
//!
//! Sole authority that assigns entries their chain position: read the
//! head, seal the draft against it, then commit through the store's
//! conditional append. Losing the race to another writer restarts from
//! a fresh head after a jittered backoff, a bounded number of times.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::audit::canonical::GENESIS_HASH;
use crate::audit::entry::{AuditEntry, AuditEntryRequest, EntryDraft, RequestOrigin};
use crate::config::SequencerConfig;
use crate::database::{AppendOutcome, ChainHead, LedgerStore};
use crate::error::{AuditError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct AppendReceipt {
    pub entry: AuditEntry,
    /// The id was already committed and the stored entry is returned.
    pub replayed: bool,
}

#[derive(Clone)]
pub struct Sequencer {
    store: LedgerStore,
    config: SequencerConfig,
}

impl Sequencer {
    pub fn new(store: LedgerStore, config: SequencerConfig) -> Self {
        Self { store, config }
    }

    /// Validate and commit one entry.
    ///
    /// Every store round-trip is bounded by `deadline`; once it passes,
    /// [`AuditError::DeadlineExceeded`] is returned. An interrupted commit
    /// may still have landed, so callers resubmit with the same id.
    pub async fn append(
        &self,
        request: AuditEntryRequest,
        origin: RequestOrigin,
        deadline: Option<Instant>,
    ) -> Result<AppendReceipt> {
        let draft = request.validate(origin)?;

        if let Some(existing) = bounded(deadline, 0, self.store.find(draft.id)).await? {
            return replay(&draft, existing);
        }

        let mut attempts = 0;
        while attempts < self.config.max_attempts {
            if deadline_passed(deadline) {
                warn!("Append of {} abandoned at deadline after {} attempts", draft.id, attempts);
                return Err(AuditError::DeadlineExceeded { attempts });
            }
            attempts += 1;

            let head = bounded(deadline, attempts, self.store.head()).await?;
            let (previous_hash, created_at) = link_to(head.as_ref(), Utc::now());
            let entry = draft.seal(&previous_hash, created_at)?;

            let outcome = bounded(
                deadline,
                attempts,
                self.store.append_if_head_matches(&entry, &previous_hash),
            )
            .await;
            match outcome {
                Ok(AppendOutcome::Appended(committed)) => {
                    info!("Appended audit entry {} (attempt {})", committed.summary(), attempts);
                    return Ok(AppendReceipt {
                        entry: committed,
                        replayed: false,
                    });
                }
                Ok(AppendOutcome::DuplicateId) => {
                    let existing = bounded(deadline, attempts, self.store.get(draft.id)).await?;
                    return replay(&draft, existing);
                }
                Ok(AppendOutcome::HeadMoved) | Err(AuditError::HeadConflict) => {
                    debug!("Head conflict appending {} (attempt {})", draft.id, attempts);
                }
                Err(e) => return Err(e),
            }

            if attempts < self.config.max_attempts {
                let mut delay = self.backoff(attempts);
                if let Some(deadline) = deadline {
                    delay = delay.min(deadline.saturating_duration_since(Instant::now()));
                }
                tokio::time::sleep(delay).await;
            }
        }

        warn!("Append of {} failed after {} head conflicts", draft.id, attempts);
        Err(AuditError::RetryExhausted { attempts })
    }

    /// Full-jitter exponential backoff, capped at `max_backoff_ms`.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .config
            .base_backoff_ms
            .saturating_mul(1u64 << attempt.saturating_sub(1).min(16));
        let cap = exp.min(self.config.max_backoff_ms);
        Duration::from_millis(rand::thread_rng().gen_range(0..=cap))
    }
}

/// Linkage and commit time for an entry appended after `head`.
///
/// Commit time is forced strictly past the head's so that append order
/// and `created_at` order agree even when clocks step backwards.
fn link_to(head: Option<&ChainHead>, now: DateTime<Utc>) -> (String, DateTime<Utc>) {
    match head {
        None => (GENESIS_HASH.to_string(), now),
        Some(head) => {
            let floor = head.created_at + ChronoDuration::microseconds(1);
            (head.hash.clone(), now.max(floor))
        }
    }
}

fn replay(draft: &EntryDraft, existing: AuditEntry) -> Result<AppendReceipt> {
    if !draft.matches(&existing) {
        return Err(AuditError::Validation(format!(
            "id {} is already committed with different content",
            existing.id
        )));
    }
    debug!("Replayed idempotent append of {}", existing.id);
    Ok(AppendReceipt {
        entry: existing,
        replayed: true,
    })
}

/// Run a store call, giving up with `DeadlineExceeded` at `deadline`.
async fn bounded<T>(
    deadline: Option<Instant>,
    attempts: u32,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, call)
            .await
            .map_err(|_| AuditError::DeadlineExceeded { attempts })?,
        None => call.await,
    }
}

fn deadline_passed(deadline: Option<Instant>) -> bool {
    deadline.map(|d| Instant::now() >= d).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::entry::tests::sample_request;
    use crate::database::Database;
    use uuid::Uuid;

    async fn sequencer() -> (Sequencer, LedgerStore) {
        let db = Database::new_in_memory().await.unwrap();
        (Sequencer::new(db.ledger(), SequencerConfig::default()), db.ledger())
    }

    #[test]
    fn test_commit_time_never_precedes_head() {
        let now = Utc::now();
        let head = ChainHead {
            sequence: 4,
            hash: "ab".repeat(32),
            created_at: now + ChronoDuration::seconds(10),
        };
        let (previous, created_at) = link_to(Some(&head), now);
        assert_eq!(previous, head.hash);
        assert!(created_at > head.created_at);

        let (previous, created_at) = link_to(None, now);
        assert_eq!(previous, GENESIS_HASH);
        assert_eq!(created_at, now);
    }

    #[tokio::test]
    async fn test_backoff_respects_cap() {
        let (sequencer, _) = sequencer().await;
        for attempt in 1..10 {
            assert!(sequencer.backoff(attempt) <= Duration::from_millis(200));
        }
    }

    #[tokio::test]
    async fn test_sequential_appends_link() {
        let (sequencer, store) = sequencer().await;

        let a = sequencer.append(sample_request(), RequestOrigin::default(), None).await.unwrap();
        let b = sequencer.append(sample_request(), RequestOrigin::default(), None).await.unwrap();

        assert!(a.entry.is_genesis());
        assert_eq!(b.entry.previous_hash, a.entry.current_hash);
        assert!(b.entry.created_at > a.entry.created_at);
        assert_eq!(store.head_hash().await.unwrap(), b.entry.current_hash);
    }

    #[tokio::test]
    async fn test_same_id_is_recorded_once() {
        let (sequencer, store) = sequencer().await;
        let mut request = sample_request();
        request.id = Some(Uuid::new_v4());

        let first = sequencer.append(request.clone(), RequestOrigin::default(), None).await.unwrap();
        let second = sequencer.append(request, RequestOrigin::default(), None).await.unwrap();

        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(first.entry, second.entry);
        assert_eq!(store.stats(Utc::now()).await.unwrap().total_entries, 1);
    }

    #[tokio::test]
    async fn test_id_reuse_with_different_content_rejected() {
        let (sequencer, _) = sequencer().await;
        let mut request = sample_request();
        request.id = Some(Uuid::new_v4());
        sequencer.append(request.clone(), RequestOrigin::default(), None).await.unwrap();

        request.action = "UNFREEZE_WALLET".to_string();
        let err = sequencer.append(request, RequestOrigin::default(), None).await.unwrap_err();
        assert!(matches!(err, AuditError::Validation(_)));
    }

    #[tokio::test]
    async fn test_validation_failure_touches_nothing() {
        let (sequencer, store) = sequencer().await;
        let mut request = sample_request();
        request.severity = "catastrophic".to_string();

        assert!(sequencer.append(request, RequestOrigin::default(), None).await.is_err());
        assert!(store.head().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_deadline_is_retryable() {
        let (sequencer, store) = sequencer().await;
        let deadline = Instant::now() - Duration::from_millis(1);

        let err = sequencer
            .append(sample_request(), RequestOrigin::default(), Some(deadline))
            .await
            .unwrap_err();
        assert!(matches!(err, AuditError::DeadlineExceeded { attempts: 0 }));
        assert!(err.is_retryable());
        assert!(store.head().await.unwrap().is_none());
    }
}
