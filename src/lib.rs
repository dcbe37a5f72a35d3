//! mpool — a user-space client library for object storage on block
//! devices.
//!
//! Three kinds of persistent objects live on top of a pluggable
//! `mpool_backend::Backend`:
//!
//! - [`mblock`] — bulk, append-once, commit-once data extents.
//! - [`mlog`] — append-only record logs with a generation counter.
//! - [`mdc`] — metadata containers built from a pair of mlogs, with
//!   crash-safe online compaction.
//!
//! and [`mcache`], which memory-maps committed mblocks for zero-copy
//! page-level access.
//!
//! Everything is reached through a [`pool::Pool`], opened from a
//! [`pool::PoolClient`].

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;

pub mod config;
pub mod error;
pub mod mblock;
pub mod mcache;
pub mod mdc;
pub mod mlog;
pub mod pool;
pub mod registry;

pub use config::{MdcOpenFlags, PoolConfig, PoolConfigBuilder, PoolOpenFlags};
pub use error::{Error, ErrorKind, Origin, Result};
pub use mblock::{AsyncWriteContext, MblockHandle};
pub use mcache::{Advice, Mcache};
pub use mdc::Mdc;
pub use mlog::MlogHandle;
pub use pool::{Pool, PoolClient};
pub use registry::ObjectKind;

pub use mpool_backend::{
    Backend, BackendError, BackendErrorKind, MblockProperties, MediaClass, MlogProperties, ObjectId, RecordKind,
};

#[cfg(test)]
mod tests;
