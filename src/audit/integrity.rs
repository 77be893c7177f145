//! Cached chain-integrity status.
//!
//! Full verification is O(n), so summaries read the last result while it
//! is fresh and a background task refreshes it on a schedule.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::audit::verify::{VerificationResult, Verifier};
use crate::error::Result;

#[derive(Clone)]
pub struct IntegrityMonitor {
    verifier: Verifier,
    cached: Arc<RwLock<Option<VerificationResult>>>,
    max_age: Duration,
}

impl IntegrityMonitor {
    pub fn new(verifier: Verifier, max_age: Duration) -> Self {
        Self {
            verifier,
            cached: Arc::new(RwLock::new(None)),
            max_age,
        }
    }

    /// Last full-verification result, re-verifying when stale or absent.
    pub async fn current(&self) -> Result<VerificationResult> {
        if let Some(result) = self.cached.read().await.as_ref() {
            let age = Utc::now().signed_duration_since(result.verified_at);
            if age.to_std().map(|age| age <= self.max_age).unwrap_or(true) {
                debug!("Using cached integrity result from {}", result.verified_at);
                return Ok(result.clone());
            }
        }
        self.refresh().await
    }

    pub async fn refresh(&self) -> Result<VerificationResult> {
        let result = self.verifier.verify_full().await?;
        self.record(result.clone()).await;
        Ok(result)
    }

    /// Store a full-verification result produced elsewhere.
    pub async fn record(&self, result: VerificationResult) {
        *self.cached.write().await = Some(result);
    }

    pub async fn cached(&self) -> Option<VerificationResult> {
        self.cached.read().await.clone()
    }

    pub fn spawn_refresh(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match self.refresh().await {
                    Ok(result) => info!("Scheduled integrity check: {}", result.summary()),
                    Err(e) => error!("Scheduled integrity check failed: {}", e),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::entry::tests::sample_request;
    use crate::audit::entry::RequestOrigin;
    use crate::audit::sequencer::Sequencer;
    use crate::config::SequencerConfig;
    use crate::database::Database;

    #[tokio::test]
    async fn test_fresh_result_is_reused() {
        let db = Database::new_in_memory().await.unwrap();
        let monitor = IntegrityMonitor::new(Verifier::new(db.ledger(), 100), Duration::from_secs(600));
        let sequencer = Sequencer::new(db.ledger(), SequencerConfig::default());

        let first = monitor.current().await.unwrap();
        assert_eq!(first.entries_checked, 0);

        sequencer
            .append(sample_request(), RequestOrigin::default(), None)
            .await
            .unwrap();

        // Still the cached view until refreshed.
        assert_eq!(monitor.current().await.unwrap().entries_checked, 0);
        assert_eq!(monitor.refresh().await.unwrap().entries_checked, 1);
        assert_eq!(monitor.cached().await.unwrap().entries_checked, 1);
    }

    #[tokio::test]
    async fn test_stale_result_is_recomputed() {
        let db = Database::new_in_memory().await.unwrap();
        let monitor = IntegrityMonitor::new(Verifier::new(db.ledger(), 100), Duration::ZERO);
        let sequencer = Sequencer::new(db.ledger(), SequencerConfig::default());

        monitor.current().await.unwrap();
        sequencer
            .append(sample_request(), RequestOrigin::default(), None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(monitor.current().await.unwrap().entries_checked, 1);
    }
}
