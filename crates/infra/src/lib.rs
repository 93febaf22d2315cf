//! Infrastructure layer: configuration, job storage, validator registry,
//! external capability clients and the background workers.

pub mod alerting;
pub mod audit;
pub mod config;
pub mod content;
pub mod db;
pub mod governance;
pub mod http;
pub mod jobs;
pub mod ledger;
pub mod ledger_events;
pub mod probe;
pub mod refunds;
pub mod registry;
pub mod retry;
pub mod workers;

pub use alerting::{AlertSink, Alerter, InMemoryAlertSink, SlackWebhookSink};
pub use audit::{AnchorConfig, AnchorError, AnchorResult, AuditAnchor, StorageRef, TxRef};
pub use config::{ConfigError, RouterConfig};
pub use content::{ContentStore, ContentStoreError, HttpContentStore, InMemoryContentStore};
pub use governance::{GovernanceSink, HttpGovernanceSink, InMemoryGovernanceSink, SinkError, TimelineRecord};
pub use jobs::{InMemoryJobStore, JobStore, JobStoreConfig, JobStoreError, PostgresJobStore};
pub use ledger::{ConfirmationStatus, HttpLedger, InMemoryLedger, Ledger, LedgerError, OnChainValidator};
pub use ledger_events::{
    InMemoryLedgerEventLog, LedgerEntry, LedgerEventError, LedgerEventKind, LedgerEventLog, PostgresLedgerEventLog,
};
pub use probe::{HealthProbe, HttpHealthProbe, ProbeError, ProbeReport, StaticHealthProbe};
pub use refunds::{
    InMemoryRefundAuditLog, JsonlRefundAuditLog, RefundAuditEntry, RefundAuditLog, RefundError, RefundExecutor,
    RefundOutcome,
};
pub use registry::{RegistrySnapshot, ValidatorRegistry};
pub use workers::{PeriodicTask, WorkerHandle, spawn_periodic};
