//! Durable job records and their atomic state transitions.
//!
//! ## Components
//!
//! - `JobStore`: the persistence contract every component reads and writes through
//! - `InMemoryJobStore`: single-process store for tests/dev
//! - `PostgresJobStore`: row-locked store for production

pub mod postgres;
pub mod store;

pub use postgres::PostgresJobStore;
pub use store::{InMemoryJobStore, JobStore, JobStoreConfig, JobStoreError};
