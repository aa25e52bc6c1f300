//! A uniform asynchronous surface over a [`Store`].
//!
//! The store itself is synchronous and never suspends inside its merge
//! critical section. This module runs it on a dedicated thread and exposes
//! every operation as an `async fn` on a cloneable [`StoreHandle`];
//! suspension happens only at the channel boundaries.

use anyhow::{anyhow, Result};
use tokio::sync::oneshot;
use tracing::{error, error_span, trace, warn};

use crate::{
    document::{Document, DocumentDraft},
    keys::{Author, AuthorId},
    query::Query,
    store::{IngestOrigin, IngestOutcome, Store, StoreError, WriteEvent},
};

const ACTION_CAP: usize = 64;
const EVENT_CAP: usize = 1024;

/// A channel to receive store write events on.
pub type EventReceiver = flume::Receiver<WriteEvent>;

#[derive(derive_more::Debug, strum::Display)]
enum Action {
    IngestDocument {
        document: Document,
        origin: IngestOrigin,
        #[debug("reply")]
        reply: oneshot::Sender<Result<IngestOutcome, StoreError>>,
    },
    SetDocument {
        author: Author,
        draft: DocumentDraft,
        #[debug("reply")]
        reply: oneshot::Sender<Result<IngestOutcome, StoreError>>,
    },
    GetDocument {
        path: String,
        #[debug("reply")]
        reply: oneshot::Sender<Result<Option<Document>, StoreError>>,
    },
    GetContent {
        path: String,
        #[debug("reply")]
        reply: oneshot::Sender<Result<Option<String>, StoreError>>,
    },
    QueryDocuments {
        query: Query,
        #[debug("reply")]
        reply: oneshot::Sender<Result<Vec<Document>, StoreError>>,
    },
    QueryPaths {
        query: Query,
        #[debug("reply")]
        reply: oneshot::Sender<Result<Vec<String>, StoreError>>,
    },
    QueryContents {
        query: Query,
        #[debug("reply")]
        reply: oneshot::Sender<Result<Vec<String>, StoreError>>,
    },
    Authors {
        #[debug("reply")]
        reply: oneshot::Sender<Result<Vec<AuthorId>, StoreError>>,
    },
    Forget {
        query: Query,
        #[debug("reply")]
        reply: oneshot::Sender<Result<usize, StoreError>>,
    },
    RemoveExpired {
        #[debug("reply")]
        reply: oneshot::Sender<Result<usize, StoreError>>,
    },
    SetConfig {
        key: String,
        value: String,
        #[debug("reply")]
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    GetConfig {
        key: String,
        #[debug("reply")]
        reply: oneshot::Sender<Result<Option<String>, StoreError>>,
    },
    DeleteConfig {
        key: String,
        #[debug("reply")]
        reply: oneshot::Sender<Result<bool, StoreError>>,
    },
    DeleteAllConfig {
        #[debug("reply")]
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    IsClosed {
        #[debug("reply")]
        reply: oneshot::Sender<bool>,
    },
    Close {
        delete: bool,
        #[debug("reply")]
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    Shutdown,
}

/// Handle to a store running on its own thread.
///
/// Cheap to clone. The thread stops when [`StoreHandle::shutdown`] is called
/// or every handle is dropped; either way the store is closed on the way out.
#[derive(Debug, Clone)]
pub struct StoreHandle {
    tx: flume::Sender<Action>,
}

#[allow(missing_docs)]
impl StoreHandle {
    /// Spawn an actor thread owning `store` and return a handle to it, plus
    /// a bounded receiver of the store's write events.
    pub fn spawn(store: Store) -> (StoreHandle, EventReceiver) {
        let (event_tx, event_rx) = flume::bounded(EVENT_CAP);
        let (action_tx, action_rx) = flume::bounded(ACTION_CAP);
        store.on_write(Box::new(move |event| {
            if event_tx.try_send(event.clone()).is_err() {
                warn!("dropping write event: receiver full or gone");
            }
        }));
        let workspace = store.workspace().fmt_short();
        let mut actor = StoreActor { store, action_rx };
        std::thread::spawn(move || {
            let span = error_span!("store", %workspace);
            let _enter = span.enter();
            if let Err(err) = actor.run() {
                error!("store actor closed with error: {err:?}");
            }
        });
        (StoreHandle { tx: action_tx }, event_rx)
    }

    pub async fn ingest_document(
        &self,
        document: Document,
        origin: IngestOrigin,
    ) -> Result<IngestOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::IngestDocument {
            document,
            origin,
            reply,
        })
        .await?;
        Ok(rx.await??)
    }

    pub async fn set(&self, author: Author, draft: DocumentDraft) -> Result<IngestOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::SetDocument {
            author,
            draft,
            reply,
        })
        .await?;
        Ok(rx.await??)
    }

    pub async fn get_document(&self, path: impl Into<String>) -> Result<Option<Document>> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::GetDocument {
            path: path.into(),
            reply,
        })
        .await?;
        Ok(rx.await??)
    }

    pub async fn get_content(&self, path: impl Into<String>) -> Result<Option<String>> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::GetContent {
            path: path.into(),
            reply,
        })
        .await?;
        Ok(rx.await??)
    }

    pub async fn documents(&self, query: Query) -> Result<Vec<Document>> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::QueryDocuments { query, reply }).await?;
        Ok(rx.await??)
    }

    pub async fn paths(&self, query: Query) -> Result<Vec<String>> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::QueryPaths { query, reply }).await?;
        Ok(rx.await??)
    }

    pub async fn contents(&self, query: Query) -> Result<Vec<String>> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::QueryContents { query, reply }).await?;
        Ok(rx.await??)
    }

    pub async fn authors(&self) -> Result<Vec<AuthorId>> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::Authors { reply }).await?;
        Ok(rx.await??)
    }

    pub async fn forget(&self, query: Query) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::Forget { query, reply }).await?;
        Ok(rx.await??)
    }

    pub async fn remove_expired_documents(&self) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::RemoveExpired { reply }).await?;
        Ok(rx.await??)
    }

    pub async fn set_config(&self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::SetConfig {
            key: key.into(),
            value: value.into(),
            reply,
        })
        .await?;
        Ok(rx.await??)
    }

    pub async fn get_config(&self, key: impl Into<String>) -> Result<Option<String>> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::GetConfig {
            key: key.into(),
            reply,
        })
        .await?;
        Ok(rx.await??)
    }

    pub async fn delete_config(&self, key: impl Into<String>) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::DeleteConfig {
            key: key.into(),
            reply,
        })
        .await?;
        Ok(rx.await??)
    }

    pub async fn delete_all_config(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::DeleteAllConfig { reply }).await?;
        Ok(rx.await??)
    }

    pub async fn is_closed(&self) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::IsClosed { reply }).await?;
        Ok(rx.await?)
    }

    pub async fn close(&self, delete: bool) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::Close { delete, reply }).await?;
        Ok(rx.await??)
    }

    /// Close the store and stop the actor thread.
    pub async fn shutdown(&self) {
        self.send(Action::Shutdown).await.ok();
    }

    async fn send(&self, action: Action) -> Result<()> {
        self.tx.send_async(action).await?;
        Ok(())
    }
}

struct StoreActor {
    store: Store,
    action_rx: flume::Receiver<Action>,
}

impl StoreActor {
    fn run(&mut self) -> Result<()> {
        loop {
            let Ok(action) = self.action_rx.recv() else {
                break;
            };
            trace!(%action, "tick");
            let is_shutdown = matches!(action, Action::Shutdown);
            if let Err(err) = self.on_action(action) {
                warn!("failed to send reply: {err}");
            }
            if is_shutdown {
                break;
            }
        }
        if !self.store.is_closed() {
            self.store.close(false).ok();
        }
        trace!("shutdown");
        Ok(())
    }

    fn on_action(&mut self, action: Action) -> Result<()> {
        match action {
            Action::IngestDocument {
                document,
                origin,
                reply,
            } => send_reply(reply, self.store.ingest_document(document, origin)),
            Action::SetDocument {
                author,
                draft,
                reply,
            } => send_reply(reply, self.store.set(&author, draft)),
            Action::GetDocument { path, reply } => {
                send_reply(reply, self.store.get_document(path))
            }
            Action::GetContent { path, reply } => send_reply(reply, self.store.get_content(path)),
            Action::QueryDocuments { query, reply } => {
                send_reply(reply, self.store.documents(query))
            }
            Action::QueryPaths { query, reply } => send_reply(reply, self.store.paths(query)),
            Action::QueryContents { query, reply } => send_reply(reply, self.store.contents(query)),
            Action::Authors { reply } => send_reply(reply, self.store.authors()),
            Action::Forget { query, reply } => send_reply(reply, self.store.forget(query)),
            Action::RemoveExpired { reply } => {
                send_reply(reply, self.store.remove_expired_documents())
            }
            Action::SetConfig { key, value, reply } => {
                send_reply(reply, self.store.set_config(&key, &value))
            }
            Action::GetConfig { key, reply } => send_reply(reply, self.store.get_config(&key)),
            Action::DeleteConfig { key, reply } => {
                send_reply(reply, self.store.delete_config(&key))
            }
            Action::DeleteAllConfig { reply } => send_reply(reply, self.store.delete_all_config()),
            Action::IsClosed { reply } => send_reply(reply, self.store.is_closed()),
            Action::Close { delete, reply } => send_reply(reply, self.store.close(delete)),
            Action::Shutdown => Ok(()),
        }
    }
}

fn send_reply<T>(sender: oneshot::Sender<T>, value: T) -> Result<()> {
    sender.send(value).map_err(receiver_dropped)
}

fn receiver_dropped<T>(_err: T) -> anyhow::Error {
    anyhow!("receiver dropped")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        driver::memory::MemoryDriver, validator::Ed25519Validator, History, WorkspaceSecret,
    };

    fn spawn_memory_store() -> (StoreHandle, flume::Receiver<WriteEvent>, Author) {
        let mut rng = rand::thread_rng();
        let workspace = WorkspaceSecret::new(&mut rng).id();
        let author = Author::new(&mut rng);
        let store = Store::new(
            Box::new(MemoryDriver::new()),
            vec![Arc::new(Ed25519Validator)],
            workspace,
        )
        .unwrap();
        let (handle, events) = StoreHandle::spawn(store);
        (handle, events, author)
    }

    fn draft(path: &str, content: &str) -> DocumentDraft {
        DocumentDraft {
            format: Ed25519Validator::FORMAT.to_string(),
            path: path.to_string(),
            content: content.to_string(),
            timestamp: None,
            delete_after: None,
        }
    }

    #[tokio::test]
    async fn write_and_read_through_the_handle() -> Result<()> {
        let (handle, events, author) = spawn_memory_store();

        let outcome = handle.set(author.clone(), draft("/hello", "world")).await?;
        assert_eq!(outcome, IngestOutcome::Accepted);
        handle.set(author.clone(), draft("/hello", "again")).await?;

        assert_eq!(
            handle.get_content("/hello").await?,
            Some("again".to_string())
        );
        let docs = handle.documents(Query::all().history(History::All)).await?;
        assert_eq!(docs.len(), 1);
        assert_eq!(handle.paths(Query::all()).await?, vec!["/hello"]);
        assert_eq!(handle.authors().await?, vec![author.id()]);
        assert_eq!(
            handle.contents(Query::all()).await?,
            vec!["again".to_string()]
        );

        // Re-offering a stored document changes nothing.
        let doc = docs[0].clone();
        assert_eq!(
            handle
                .ingest_document(doc.clone(), IngestOrigin::Remote)
                .await?,
            IngestOutcome::Ignored
        );
        assert_eq!(handle.get_document("/hello").await?, Some(doc));
        assert_eq!(handle.remove_expired_documents().await?, 0);

        let event = events.recv_async().await?;
        assert!(event.is_local());
        assert!(event.is_latest);
        assert_eq!(event.document.content, "world");
        let event = events.recv_async().await?;
        assert_eq!(event.document.content, "again");

        handle.set_config("displayName", "garden").await?;
        assert_eq!(
            handle.get_config("displayName").await?,
            Some("garden".to_string())
        );
        assert!(handle.delete_config("displayName").await?);
        handle.set_config("a", "1").await?;
        handle.delete_all_config().await?;
        assert_eq!(handle.get_config("a").await?, None);

        assert_eq!(handle.forget(Query::all()).await?, 1);
        assert_eq!(handle.get_document("/hello").await?, None);

        handle.close(false).await?;
        assert!(handle.is_closed().await?);
        assert!(handle.get_content("/hello").await.is_err());

        handle.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn dropping_every_handle_stops_the_actor() -> Result<()> {
        let (handle, _events, author) = spawn_memory_store();
        handle.set(author, draft("/x", "y")).await?;
        let probe = handle.clone();
        drop(handle);
        probe.shutdown().await;
        // The thread is gone; sends fail instead of hanging.
        assert!(probe.authors().await.is_err());
        Ok(())
    }
}
