#![forbid(unsafe_code)]
#![deny(
    unused_must_use,
    unreachable_pub,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls
)]
#![allow(clippy::module_name_repetitions)]

//! Engine-agnostic pipeline domain: the item/request model, the status state
//! machine, transition validation, the retry policy, and the collaborator
//! interfaces the stage workers are written against.

pub mod adapters;
pub mod context;
pub mod error;
pub mod media;
pub mod model;
pub mod naming;
pub mod retry;
pub mod size;
pub mod state_machine;
pub mod store;
pub mod validation;

pub use error::{PipelineError, PipelineResult};
pub use fetcharr_events::ItemStatus;
