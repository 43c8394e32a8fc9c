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

//! Application wiring for the Convoy orchestrator.
//!
//! The original design kept process-wide singletons; here everything hangs
//! off one explicit [`context::AppContext`] passed by reference, with the
//! store as the only shared mutable collaborator.

pub mod context;

pub use context::AppContext;
