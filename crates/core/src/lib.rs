//! `swarmrouter-core`: domain foundation for the inference router.
//!
//! This crate contains **pure domain** types (no infrastructure concerns):
//! job lifecycle, validator snapshots, retry policy, audit events and alerts.

pub mod alert;
pub mod audit;
pub mod error;
pub mod id;
pub mod job;
pub mod retry;
pub mod validator;

pub use alert::{Alert, AlertPriority};
pub use audit::{AuditEvent, canonical_json, sha256_hex};
pub use error::{DomainError, DomainResult};
pub use id::{JobId, LedgerEntryId, ValidatorId};
pub use job::{Job, JobStatus, NewJob};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use validator::{MAX_REPUTATION, Validator, ValidatorUpdate};
