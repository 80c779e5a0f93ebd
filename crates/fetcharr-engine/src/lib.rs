#![forbid(unsafe_code)]
#![deny(
    unused_must_use,
    unreachable_pub,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls
)]
#![allow(clippy::module_name_repetitions)]

//! The pipeline engine: the orchestrator (sole mutator of item state), the
//! worker scheduler, the four stage workers, and the crash-recovery worker.

pub mod orchestrator;
pub mod runtime;
pub mod scheduler;
pub mod settings;
pub mod workers;

pub use orchestrator::{EpisodeSpec, NewRequest, Orchestrator, TransitionPatch};
pub use runtime::{Collaborators, PipelineRuntime};
pub use scheduler::{Scheduler, TaskStatus};
pub use settings::{
    DeliverSettings, DownloadSettings, EncodeSettings, EngineSettings, WorkerSettings,
};
