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

//! Compose-bundle rendering and container runtime plumbing.
//!
//! This crate owns every subprocess the orchestrator spawns for deployment:
//! the compose CLI, ad-hoc `docker` commands, and the `openssl` invocation
//! that mints the proxy's self-signed certificate. Rendering the bundle
//! itself is a pure function of the configuration document and the secrets
//! snapshot.

pub mod docker;
pub mod driver;
pub mod error;
pub mod proc;
pub mod render;
pub mod tls;

pub use docker::DockerCli;
pub use driver::{ComposeDriver, DriverOutcome};
pub use error::{ComposeError, ComposeResult};
pub use proc::{CommandOutput, CommandRunner};
pub use render::{RenderResult, SecretsSnapshot, TemplateRenderer};
pub use tls::ensure_proxy_assets;
