//! Core of the MarFS near-POSIX filesystem: datastreams packing and
//! chunking file data across an erasure-coded object store, the extended
//! attribute tagging that keeps every object self-describing, and the
//! offline resource manager that walks datastreams to enforce quotas and
//! drive garbage collection, rebuild and repack.
//!
//! Metadata and object I/O are reached exclusively through the [`mdal`]
//! and [`dal`] trait surfaces; the in-memory drivers under
//! [`mdal::mem`] / [`dal::mem`] run the entire stack without a storage
//! backend and back the test suite.

pub mod config;
#[cfg(test)]
pub(crate) mod testutil;
pub mod dal;
pub mod datastream;
pub mod error;
pub mod mdal;
pub mod recovery;
pub mod rsrc;
pub mod tagging;

pub use config::{MarfsConfig, Namespace, NsPerms, Position, Repo};
pub use datastream::{DataStream, StreamType};
pub use error::Error;
pub use tagging::{Ftag, Gctag, Rtag};

pub type Result<T> = std::result::Result<T, crate::Error>;
