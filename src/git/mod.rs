//! Git repository access.
//!
//! Bare repositories live on the local filesystem and all protocol work
//! shells out to the `git` binary via `tokio::process::Command` for
//! non-blocking execution.

pub mod bare_repo;
pub mod commands;
pub mod repository;

pub use commands::{advertise_refs, upload_pack_streamed};
pub use repository::{BareRepoBuilder, RepositoryHandle};
