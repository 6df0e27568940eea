//! Fjall-based persistence for jobs, resources and processing statistics
//!
//! The master treats this as its persistence collaborator: every call reads
//! or writes one record keyed by a stable identifier (job id, resource id,
//! `(resource, task type, source type)`), and there are no cross-record
//! transactions.
//!
//! Retention: historical statistics records expire after
//! `retention.statistics_ttl_days`; pruning runs through
//! `FjallStore::prune_expired()`.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use harvester::ledger::FjallStore;
//!
//! let store = FjallStore::open("data/ledger")?;
//! store.upsert_job(&job)?;
//! let job = store.get_job("job-1")?;
//! ```

pub mod error;
pub mod partitions;
pub mod pruning;
pub mod store;

pub use error::{LedgerError, Result};
pub use pruning::PruneStats;
pub use store::{FjallStore, StoreStats};
