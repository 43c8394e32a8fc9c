#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls
)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::multiple_crate_versions)]

//! File-backed persistence for the Convoy orchestrator.
//!
//! The store is the sole owner of the on-disk configuration document and the
//! five runtime state sections. Every write lands through an atomic
//! temp-fsync-rename sequence, so a crash leaves either the old or the new
//! file intact. Corrupt section files are recovered by extracting the longest
//! valid JSON prefix and moving the damaged original aside.

pub mod atomic;
pub mod auth;
pub mod error;
pub mod recover;
pub mod state;
mod store;

pub use auth::{hash_password, needs_rehash, verify_password};
pub use error::{StoreError, StoreResult};
pub use state::{
    AuthSection, LedgerEntry, LedgerStatus, PipelineSection, RunRecord, RunsSection, Section,
    SecretsSection, ServiceState, ServicesSection, SessionRecord, UserRecord, RUN_LOG_CAPACITY,
};
pub use store::ConfigStore;
