//! The workspace-scoped document store.
//!
//! A [`Store`] binds one workspace address to one [`Driver`] and a set of
//! [`Validator`]s. It owns the convergence semantics: every peer that ingests
//! the same set of signed documents ends up with the same observable state,
//! regardless of arrival order. Writes go through the last-write-wins merge
//! rule per `(path, author)` slot; reads go through the query engine of the
//! driver below.

use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::SystemTime,
};

use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use crate::{
    document::{Document, DocumentDraft},
    driver::Driver,
    keys::{Author, AuthorId, WorkspaceId},
    query::{History, Query},
    validator::{ValidationError, Validator},
};

/// Current wall clock in microseconds since the Unix epoch.
pub(crate) fn system_time_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("time drift")
        .as_micros() as u64
}

/// Errors returned by store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store has been closed.
    #[error("store is closed")]
    Closed,
    /// The document, workspace or timestamp was rejected.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// The storage driver failed.
    #[error("storage driver error")]
    Driver(#[source] anyhow::Error),
}

/// Outcome of a write operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The document was written to its slot.
    Accepted,
    /// The slot already held an equal or newer document; nothing changed.
    Ignored,
}

/// Where an ingested document came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOrigin {
    /// Authored on this peer through [`Store::set`].
    Local,
    /// Received from another peer.
    Remote,
}

/// Published to write observers after every accepted write.
#[derive(Debug, Clone)]
pub struct WriteEvent {
    /// Where the document came from.
    pub origin: IngestOrigin,
    /// Whether the document is the latest live version of its path.
    pub is_latest: bool,
    /// The document as stored.
    pub document: Document,
}

impl WriteEvent {
    /// Whether the write was authored locally.
    pub fn is_local(&self) -> bool {
        self.origin == IngestOrigin::Local
    }
}

/// Callback invoked for every accepted write.
pub type OnWriteCallback = Box<dyn Fn(&WriteEvent) + Send + Sync + 'static>;

/// Handle to unregister a write observer.
#[derive(Debug, Clone)]
pub struct RemovalToken(u64);

/// The per-workspace document store.
///
/// Cheap to clone; all clones share the same state. The merge critical
/// section (predecessor read, upsert, latest read) runs under a single write
/// guard, so a store may be shared across threads.
#[derive(derive_more::Debug, Clone)]
pub struct Store {
    inner: Arc<RwLock<StoreInner>>,
    #[debug(skip)]
    on_write: Arc<RwLock<HashMap<u64, OnWriteCallback>>>,
    on_write_removal_id: Arc<AtomicU64>,
}

#[derive(Debug)]
struct StoreInner {
    workspace: WorkspaceId,
    driver: Box<dyn Driver>,
    validators: HashMap<String, Arc<dyn Validator>>,
    now_override: Option<u64>,
    closed: bool,
}

impl StoreInner {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn now(&self) -> u64 {
        self.now_override.unwrap_or_else(system_time_now)
    }

    fn validator_for(&self, format: &str) -> Result<Arc<dyn Validator>, ValidationError> {
        self.validators
            .get(format)
            .cloned()
            .ok_or_else(|| ValidationError::UnknownFormat(format.to_string()))
    }

    /// The latest live document at `path`, tombstones included.
    fn latest_at(&mut self, path: &str, now: u64) -> Result<Option<Document>, StoreError> {
        let query = Query::all().path(path).limit(1);
        let mut docs = self
            .driver
            .query_documents(&query, now)
            .map_err(StoreError::Driver)?;
        Ok(if docs.is_empty() {
            None
        } else {
            Some(docs.swap_remove(0))
        })
    }
}

impl Store {
    /// Create a store for `workspace` over `driver`.
    ///
    /// Requires at least one validator, and at least one validator that
    /// accepts the workspace address; otherwise the first rejection is
    /// returned. Calls [`Driver::begin`].
    pub fn new(
        mut driver: Box<dyn Driver>,
        validators: Vec<Arc<dyn Validator>>,
        workspace: WorkspaceId,
    ) -> Result<Self, StoreError> {
        if validators.is_empty() {
            return Err(ValidationError::NoValidators.into());
        }
        let mut first_rejection = None;
        let accepted = validators.iter().any(|validator| {
            match validator.check_workspace_is_valid(&workspace) {
                Ok(()) => true,
                Err(err) => {
                    first_rejection.get_or_insert(err);
                    false
                }
            }
        });
        if !accepted {
            // `first_rejection` is always set here: validators is non-empty
            // and none accepted.
            return Err(first_rejection.expect("rejection recorded").into());
        }

        driver.begin(&workspace).map_err(StoreError::Driver)?;

        let validators = validators
            .into_iter()
            .map(|validator| (validator.format().to_string(), validator))
            .collect();
        Ok(Store {
            inner: Arc::new(RwLock::new(StoreInner {
                workspace,
                driver,
                validators,
                now_override: None,
                closed: false,
            })),
            on_write: Default::default(),
            on_write_removal_id: Arc::new(AtomicU64::new(0)),
        })
    }

    /// The workspace address this store is bound to.
    pub fn workspace(&self) -> WorkspaceId {
        self.inner.read().workspace
    }

    /// Override the clock used in all time-dependent decisions.
    ///
    /// `None` restores the wall clock (microseconds since the Unix epoch).
    pub fn set_now_override(&self, now: Option<u64>) {
        self.inner.write().now_override = now;
    }

    /// Register a write observer. Observers run synchronously after every
    /// accepted write, in registration order; a panicking observer is
    /// isolated from the others and from the store.
    pub fn on_write(&self, callback: OnWriteCallback) -> RemovalToken {
        let removal_id = self.on_write_removal_id.fetch_add(1, Ordering::SeqCst);
        self.on_write.write().insert(removal_id, callback);
        RemovalToken(removal_id)
    }

    /// Unregister a write observer. Returns whether it was registered.
    pub fn remove_on_write(&self, token: RemovalToken) -> bool {
        self.on_write.write().remove(&token.0).is_some()
    }

    /// Sorted distinct authors of the live documents.
    pub fn authors(&self) -> Result<Vec<AuthorId>, StoreError> {
        let mut inner = self.inner.write();
        inner.ensure_open()?;
        let now = inner.now();
        inner.driver.authors(now).map_err(StoreError::Driver)
    }

    /// Sorted unique paths of documents matching `query`.
    pub fn paths(&self, query: Query) -> Result<Vec<String>, StoreError> {
        let mut inner = self.inner.write();
        inner.ensure_open()?;
        let now = inner.now();
        inner
            .driver
            .query_paths(&query, now)
            .map_err(StoreError::Driver)
    }

    /// Documents matching `query`, in history order.
    pub fn documents(&self, query: Query) -> Result<Vec<Document>, StoreError> {
        let mut inner = self.inner.write();
        inner.ensure_open()?;
        let now = inner.now();
        inner
            .driver
            .query_documents(&query, now)
            .map_err(StoreError::Driver)
    }

    /// The content of each document matching `query`, in history order.
    pub fn contents(&self, query: Query) -> Result<Vec<String>, StoreError> {
        Ok(self
            .documents(query)?
            .into_iter()
            .map(|doc| doc.content)
            .collect())
    }

    /// The latest live document at `path`, if any.
    pub fn get_document(&self, path: impl AsRef<str>) -> Result<Option<Document>, StoreError> {
        let mut inner = self.inner.write();
        inner.ensure_open()?;
        let now = inner.now();
        inner.latest_at(path.as_ref(), now)
    }

    /// The content of the latest live document at `path`, if any.
    pub fn get_content(&self, path: impl AsRef<str>) -> Result<Option<String>, StoreError> {
        Ok(self.get_document(path)?.map(|doc| doc.content))
    }

    /// Ingest a signed document into its `(path, author)` slot.
    ///
    /// The document is validated by the validator registered for its format
    /// and must be addressed to this store's workspace. If the slot already
    /// holds a live document with an equal or greater `(timestamp,
    /// signature)` pair, the ingest returns [`IngestOutcome::Ignored`] and
    /// nothing changes. Otherwise the slot is overwritten and a
    /// [`WriteEvent`] is published.
    pub fn ingest_document(
        &self,
        doc: Document,
        origin: IngestOrigin,
    ) -> Result<IngestOutcome, StoreError> {
        let event = {
            let mut inner = self.inner.write();
            inner.ensure_open()?;
            let validator = inner.validator_for(&doc.format)?;
            let now = inner.now();
            validator.check_document_is_valid(&doc, now)?;
            if doc.workspace != inner.workspace {
                return Err(ValidationError::WrongWorkspace {
                    expected: inner.workspace,
                    actual: doc.workspace,
                }
                .into());
            }

            // Critical section: the predecessor read, the upsert and the
            // latest read form one atomic step under the write guard.
            let slot_query = Query::all()
                .path(doc.path.clone())
                .author(doc.author)
                .history(History::All);
            let predecessor = inner
                .driver
                .query_documents(&slot_query, now)
                .map_err(StoreError::Driver)?
                .into_iter()
                .next();
            // An expired predecessor is invisible to the query and therefore
            // simply superseded.
            if let Some(prev) = predecessor {
                if (doc.timestamp, doc.signature.as_str())
                    <= (prev.timestamp, prev.signature.as_str())
                {
                    trace!(
                        path = %doc.path,
                        author = %doc.author.fmt_short(),
                        "ignoring obsolete document"
                    );
                    return Ok(IngestOutcome::Ignored);
                }
            }
            inner
                .driver
                .upsert_document(doc.clone())
                .map_err(StoreError::Driver)?;
            let latest = inner.latest_at(&doc.path, now)?;
            let is_latest = latest.as_ref() == Some(&doc);
            debug!(
                path = %doc.path,
                author = %doc.author.fmt_short(),
                is_latest,
                "stored document"
            );
            WriteEvent {
                origin,
                is_latest,
                document: doc,
            }
        };
        self.publish(&event);
        Ok(IngestOutcome::Accepted)
    }

    /// Author a document locally: complete the draft, sign it, ingest it.
    ///
    /// When the draft carries no timestamp (or `0`), the store assigns the
    /// current time bumped past the latest document at the path, so a local
    /// author's write always supersedes what they can currently see. The
    /// intended lifespan of an ephemeral document is preserved across the
    /// bump. An explicit timestamp is taken as-is after a validator bounds
    /// check.
    pub fn set(
        &self,
        keypair: &Author,
        draft: DocumentDraft,
    ) -> Result<IngestOutcome, StoreError> {
        let doc = {
            let mut inner = self.inner.write();
            inner.ensure_open()?;
            let validator = inner.validator_for(&draft.format)?;
            let now = inner.now();

            let should_bump = matches!(draft.timestamp, None | Some(0));
            let timestamp = match draft.timestamp {
                None | Some(0) => now,
                Some(timestamp) => {
                    validator.check_timestamp_is_ok(timestamp, draft.delete_after, now)?;
                    timestamp
                }
            };

            let mut doc = Document {
                format: draft.format,
                workspace: inner.workspace,
                path: draft.path,
                content_hash: Document::hash_content(&draft.content),
                content: draft.content,
                author: keypair.id(),
                timestamp,
                delete_after: draft.delete_after,
                signature: String::new(),
            };

            if should_bump {
                let lifespan = doc
                    .delete_after
                    .map(|delete_after| delete_after.saturating_sub(doc.timestamp));
                if let Some(latest) = inner.latest_at(&doc.path, now)? {
                    doc.timestamp = doc.timestamp.max(latest.timestamp + 1);
                }
                if let Some(lifespan) = lifespan {
                    doc.delete_after = Some(doc.timestamp + lifespan);
                }
            }

            validator.sign_document(keypair, doc)?
        };
        self.ingest_document(doc, IngestOrigin::Local)
    }

    /// Drop every document matching `query` from the driver.
    ///
    /// Unless the query says otherwise, every version is forgotten, not just
    /// the winning one per path. Returns the number of documents removed.
    /// Forgetting is local bookkeeping, not a write: no events are published
    /// and peers holding the documents will offer them again.
    pub fn forget(&self, mut query: Query) -> Result<usize, StoreError> {
        if query.history.is_none() {
            query.history = Some(History::All);
        }
        let mut inner = self.inner.write();
        inner.ensure_open()?;
        let now = inner.now();
        inner
            .driver
            .forget_documents(&query, now)
            .map_err(StoreError::Driver)
    }

    /// Reclaim expired documents. Returns the number removed.
    pub fn remove_expired_documents(&self) -> Result<usize, StoreError> {
        let mut inner = self.inner.write();
        inner.ensure_open()?;
        let now = inner.now();
        inner
            .driver
            .remove_expired_documents(now)
            .map_err(StoreError::Driver)
    }

    /// Set a workspace-local config value.
    pub fn set_config(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner.ensure_open()?;
        inner
            .driver
            .set_config(key, value)
            .map_err(StoreError::Driver)
    }

    /// Get a workspace-local config value.
    pub fn get_config(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut inner = self.inner.write();
        inner.ensure_open()?;
        inner.driver.get_config(key).map_err(StoreError::Driver)
    }

    /// Delete a config value. Returns whether the key existed.
    pub fn delete_config(&self, key: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        inner.ensure_open()?;
        inner.driver.delete_config(key).map_err(StoreError::Driver)
    }

    /// Delete all config values.
    pub fn delete_all_config(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner.ensure_open()?;
        inner.driver.delete_all_config().map_err(StoreError::Driver)
    }

    /// Whether [`Store::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.read().closed
    }

    /// Close the store and release the driver. With `delete`, also destroy
    /// the backing storage.
    ///
    /// Closing an already-closed store is a no-op; every other operation on
    /// a closed store returns [`StoreError::Closed`].
    pub fn close(&self, delete: bool) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Ok(());
        }
        inner.closed = true;
        inner.driver.close(delete).map_err(StoreError::Driver)
    }

    fn publish(&self, event: &WriteEvent) {
        let callbacks = self.on_write.read();
        for callback in callbacks.values() {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                warn!("write observer panicked");
            }
        }
    }
}
