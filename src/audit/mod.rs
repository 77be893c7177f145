//! Audit Log System
//!
//! Tamper-evident ledger of security-relevant actions. Each entry commits
//! to its predecessor through a SHA-256 hash chain, so any retroactive
//! alteration or deletion is detectable by re-verification.

pub mod action;
pub mod canonical;
pub mod entry;
pub mod integrity;
pub mod merkle;
pub mod query;
pub mod sequencer;
pub mod verify;

pub use action::{ActorType, AuditAction, Outcome, Severity};
pub use canonical::GENESIS_HASH;
pub use entry::{AuditEntry, AuditEntryRequest, RequestOrigin};
pub use integrity::IntegrityMonitor;
pub use merkle::{ChainCheckpoint, CheckpointBuilder, MerkleProof};
pub use query::{ChainSummary, IntegrityStatus, Page, PageRequest, QueryService, SearchFilter};
pub use sequencer::{AppendReceipt, Sequencer};
pub use verify::{ChainBreakKind, VerificationResult, Verifier};
