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

//! The converge engine: preflight validation, config diffing, the
//! dependency-aware scheduler, and the staged apply runner.

pub mod diff;
pub mod runner;
pub mod scheduler;
pub mod validate;

pub use diff::{compute_diff, ConfigChange, ConfigDiff};
pub use runner::{verify_only, ApplyReport, ApplyRunner, Deployer};
pub use scheduler::{Scheduler, ServiceRun};
pub use validate::{run_validation, ValidationResult};
