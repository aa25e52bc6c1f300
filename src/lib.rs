//! Per-workspace document store for a peer-to-peer, eventually-consistent
//! sync system.
//!
//! A workspace holds signed [`Document`]s authored by keypair-identified
//! [`Author`]s. The [`Store`] accepts locally authored documents through
//! [`Store::set`] and remotely received ones through
//! [`Store::ingest_document`], merging last-write-wins per `(path, author)`
//! slot with a deterministic `(timestamp, signature)` tiebreak: every peer
//! that ingests the same set of signed documents converges to the same
//! observable state, regardless of arrival order.
//!
//! Storage is pluggable through the [`driver::Driver`] trait; the crate ships
//! an [in-memory backend](driver::memory::MemoryDriver) and an
//! [on-disk backend](driver::fs::FsDriver) built on [`redb`]. Document
//! well-formedness and signing are delegated to [`Validator`]s, dispatched on
//! each document's format identifier. Queries are sparse selector records
//! ([`Query`]) with latest-per-path folding, deterministic ordering and
//! byte-bounded truncation. An asynchronous facade over the whole surface
//! lives in [`actor`].
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod actor;
mod document;
pub mod driver;
mod keys;
mod query;
mod store;
mod validator;

pub use self::document::*;
pub use self::driver::Driver;
pub use self::keys::{Author, AuthorId, WorkspaceId, WorkspaceSecret};
pub use self::query::*;
pub use self::store::*;
pub use self::validator::*;
