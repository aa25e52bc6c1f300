//! Persistence drivers.
//!
//! A driver owns the raw set of documents for one workspace and answers
//! primitive queries over them. It makes no policy decisions: validation,
//! timestamp handling, accept/ignore and event publishing all live in the
//! [`Store`](crate::Store) above it.

use anyhow::Result;

use crate::{document::Document, keys::AuthorId, keys::WorkspaceId, query::Query};

pub mod fs;
pub mod memory;
pub(crate) mod util;

/// Abstraction over the available storage backends.
///
/// All operations take `now` (microseconds) where expiry is involved; expired
/// documents are invisible to every query operation, whether or not they have
/// been swept yet.
pub trait Driver: std::fmt::Debug + Send + Sync + 'static {
    /// One-time initialization for a workspace: ensure schema, load
    /// persistent state, reclaim expired documents.
    fn begin(&mut self, workspace: &WorkspaceId) -> Result<()>;

    /// Sorted unique authors over the live documents.
    fn authors(&mut self, now: u64) -> Result<Vec<AuthorId>>;

    /// Sorted unique paths of live documents matching `query`.
    ///
    /// `limit` applies to the paths; `limit_bytes` and the cursor are
    /// ignored.
    fn query_paths(&mut self, query: &Query, now: u64) -> Result<Vec<String>>;

    /// Live documents matching `query`, in history order, limits applied.
    fn query_documents(&mut self, query: &Query, now: u64) -> Result<Vec<Document>>;

    /// Unconditional write into the document's `(path, author)` slot.
    fn upsert_document(&mut self, doc: Document) -> Result<()>;

    /// Delete every document whose expiry instant lies before `now`.
    /// Returns the number of documents reclaimed.
    fn remove_expired_documents(&mut self, now: u64) -> Result<usize>;

    /// Delete every live document matching `query`. Returns the number of
    /// documents removed.
    fn forget_documents(&mut self, query: &Query, now: u64) -> Result<usize>;

    /// Set a workspace-local config value.
    fn set_config(&mut self, key: &str, value: &str) -> Result<()>;

    /// Get a workspace-local config value.
    fn get_config(&mut self, key: &str) -> Result<Option<String>>;

    /// Delete a config value. Returns whether the key existed.
    fn delete_config(&mut self, key: &str) -> Result<bool>;

    /// Delete all config values.
    fn delete_all_config(&mut self) -> Result<()>;

    /// Release all handles. With `delete`, also destroy the backing store.
    fn close(&mut self, delete: bool) -> Result<()>;
}
