#![forbid(unsafe_code)]
#![deny(
    unused_must_use,
    unreachable_pub,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls
)]
#![allow(clippy::module_name_repetitions)]

//! Postgres persistence layer for the pipeline: requests, items and local
//! download records, with the worker poll index and optimistic item updates.

mod rows;
mod store;

pub use store::PgPipelineStore;
