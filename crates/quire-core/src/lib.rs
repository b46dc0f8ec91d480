//! # quire-core
//!
//! Core primitives for the Quire collaborative document update engine.
//!
//! This crate provides the foundational types shared by every component:
//!
//! - **Identifiers**: Validated project and document ids, plus seeded range ids
//! - **Storage Traits**: A conditional-write object store abstraction
//! - **Leases**: Per-document distributed locks built on that store
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging initialization and span helpers
//!
//! ## Example
//!
//! ```rust
//! use quire_core::prelude::*;
//!
//! let doc = DocId::new("5f1d6e2a9c0b").unwrap();
//! let mut ids = RangeIdGenerator::new(IdSeed::from("s1"));
//! assert_eq!(ids.next_id(), "s1000001");
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod lock;
pub mod observability;
pub mod storage;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use quire_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{DocId, IdSeed, ProjectId, RangeIdGenerator};
    pub use crate::lock::{DocLockManager, Lease, LeaseGuard, LeaseRecord};
    pub use crate::storage::{
        MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult,
    };
}

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use id::{DocId, IdSeed, ProjectId, RangeIdGenerator};
pub use lock::{DocLockManager, Lease, LeaseGuard, LeaseRecord};
pub use observability::{LogFormat, doc_span, init_logging};
pub use storage::{MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult};
