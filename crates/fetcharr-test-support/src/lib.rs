#![forbid(unsafe_code)]
#![deny(
    unused_must_use,
    unreachable_pub,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls
)]
#![allow(clippy::module_name_repetitions)]

//! Shared test scaffolding: an in-memory store, scriptable collaborator
//! stubs, fixtures, and environment probes.

mod fixtures;
mod memory;
mod stubs;

pub use fixtures::{docker_available, movie_request, sample_release, target, tv_request};
pub use memory::MemoryStore;
pub use stubs::{
    RecordedDelivery, RecordingLibrary, RecordingTransport, StubArchive, StubDispatcher,
    StubIndexer, StubTorrentClient,
};
