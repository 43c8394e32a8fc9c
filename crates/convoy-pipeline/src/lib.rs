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

//! Media post-processing worker.
//!
//! An independent loop polls the torrent client for completed downloads,
//! probes their streams, remuxes them with the configured language policy
//! (copy codecs, never transcode), and relocates the result into the media
//! library. A durable ledger keyed by torrent hash guarantees no item is
//! processed twice.

pub mod error;
pub mod naming;
pub mod probe;
pub mod remux;
pub mod worker;

pub use error::{PipelineError, PipelineResult};
pub use naming::{parse_movie_name, parse_tv_episode};
pub use probe::{probe_streams, MediaProbe, StreamInfo, StreamKind};
pub use remux::{build_remux_args, TrackSelection};
pub use worker::{PipelineWorker, TickSummary};
