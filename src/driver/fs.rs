//! On-disk storage backend.
//!
//! A single [`redb`] database per workspace: one table of documents with the
//! `(path, author)` primary key, one table of workspace-local config values.

use std::{
    ops::Bound,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use redb::{Database, ReadableTable, TableDefinition};
use tracing::debug;

use crate::{
    document::Document,
    driver::{util, Driver},
    keys::{AuthorId, WorkspaceId},
    query::Query,
    store::system_time_now,
};

/// Document records, keyed by `(path, author)` and kept sorted by redb.
/// Values are postcard-encoded [`Document`]s.
const DOCS_TABLE: TableDefinition<(&str, &[u8; 32]), &[u8]> = TableDefinition::new("docs-v1");

/// Workspace-local config values.
const CONFIG_TABLE: TableDefinition<&str, &str> = TableDefinition::new("config-v1");

const SCHEMA_VERSION_KEY: &str = "schemaVersion";
const SCHEMA_VERSION: &str = "1";

/// Stores the documents of one workspace in a single file on disk.
///
/// Two drivers over the same file are undefined behavior; redb's file lock
/// will refuse the second open.
#[derive(Debug)]
pub struct FsDriver {
    path: PathBuf,
    db: Option<Database>,
}

impl FsDriver {
    /// Create a driver for the database file at `path`.
    ///
    /// The file is created or opened by [`Driver::begin`], not here.
    pub fn new(path: impl AsRef<Path>) -> Self {
        FsDriver {
            path: path.as_ref().to_path_buf(),
            db: None,
        }
    }

    fn db(&self) -> Result<&Database> {
        self.db.as_ref().context("driver not started")
    }

    /// Candidate documents for `query`, bounded by the primary key where the
    /// query pins a path or path prefix.
    fn candidates(&self, query: &Query) -> Result<Vec<Document>> {
        let tx = self.db()?.begin_read()?;
        let table = tx.open_table(DOCS_TABLE)?;
        let author_min = [u8::MIN; 32];
        let author_max = [u8::MAX; 32];

        let mut docs = Vec::new();
        if let Some(path) = &query.path {
            let start = (path.as_str(), &author_min);
            let end = (path.as_str(), &author_max);
            for item in table.range(start..=end)? {
                let (_key, value) = item?;
                docs.push(decode(value.value())?);
            }
        } else if let Some(prefix) = &query.path_prefix {
            let start = (prefix.as_str(), &author_min);
            for item in table.range(start..)? {
                let (key, value) = item?;
                if !key.value().0.starts_with(prefix.as_str()) {
                    break;
                }
                docs.push(decode(value.value())?);
            }
        } else {
            for item in table.iter()? {
                let (_key, value) = item?;
                docs.push(decode(value.value())?);
            }
        }
        Ok(docs)
    }
}

fn decode(bytes: &[u8]) -> Result<Document> {
    Ok(postcard::from_bytes(bytes)?)
}

impl Driver for FsDriver {
    fn begin(&mut self, workspace: &WorkspaceId) -> Result<()> {
        if self.db.is_some() {
            return Ok(());
        }
        let db = Database::create(&self.path)
            .with_context(|| format!("failed to open database at {}", self.path.display()))?;

        let tx = db.begin_write()?;
        {
            let _ = tx.open_table(DOCS_TABLE)?;
            let mut config = tx.open_table(CONFIG_TABLE)?;
            let existing = config.get(SCHEMA_VERSION_KEY)?.map(|v| v.value().to_string());
            match existing {
                None => {
                    config.insert(SCHEMA_VERSION_KEY, SCHEMA_VERSION)?;
                }
                Some(version) if version == SCHEMA_VERSION => {}
                Some(version) => {
                    bail!(
                        "refusing to open {}: unknown schema version {version:?}",
                        self.path.display()
                    );
                }
            }
        }
        tx.commit()?;
        self.db = Some(db);

        let removed = self.remove_expired_documents(system_time_now())?;
        debug!(
            workspace = %workspace.fmt_short(),
            path = %self.path.display(),
            removed, "opened document database"
        );
        Ok(())
    }

    fn authors(&mut self, now: u64) -> Result<Vec<AuthorId>> {
        let docs = self.candidates(&Query::all())?;
        Ok(util::collect_authors(docs, now))
    }

    fn query_paths(&mut self, query: &Query, now: u64) -> Result<Vec<String>> {
        let docs = self.candidates(query)?;
        Ok(util::evaluate_paths(docs, query, now))
    }

    fn query_documents(&mut self, query: &Query, now: u64) -> Result<Vec<Document>> {
        let docs = self.candidates(query)?;
        Ok(util::evaluate(docs, query, now))
    }

    fn upsert_document(&mut self, doc: Document) -> Result<()> {
        let tx = self.db()?.begin_write()?;
        {
            let mut table = tx.open_table(DOCS_TABLE)?;
            let value = postcard::to_stdvec(&doc)?;
            table.insert((doc.path.as_str(), doc.author.as_bytes()), value.as_slice())?;
        }
        tx.commit()?;
        Ok(())
    }

    fn remove_expired_documents(&mut self, now: u64) -> Result<usize> {
        let tx = self.db()?.begin_write()?;
        let mut removed = 0;
        {
            let mut table = tx.open_table(DOCS_TABLE)?;
            let bounds: (Bound<(&str, &[u8; 32])>, Bound<(&str, &[u8; 32])>) =
                (Bound::Unbounded, Bound::Unbounded);
            let extract = table.extract_from_if(bounds, |_key, value| {
                postcard::from_bytes::<Document>(value)
                    .map(|doc| doc.is_expired(now))
                    .unwrap_or(false)
            })?;
            for item in extract {
                item?;
                removed += 1;
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    fn forget_documents(&mut self, query: &Query, now: u64) -> Result<usize> {
        let victims = util::evaluate(self.candidates(query)?, query, now);
        let tx = self.db()?.begin_write()?;
        {
            let mut table = tx.open_table(DOCS_TABLE)?;
            for doc in &victims {
                table.remove((doc.path.as_str(), doc.author.as_bytes()))?;
            }
        }
        tx.commit()?;
        Ok(victims.len())
    }

    fn set_config(&mut self, key: &str, value: &str) -> Result<()> {
        let tx = self.db()?.begin_write()?;
        {
            let mut table = tx.open_table(CONFIG_TABLE)?;
            table.insert(key, value)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn get_config(&mut self, key: &str) -> Result<Option<String>> {
        let tx = self.db()?.begin_read()?;
        let table = tx.open_table(CONFIG_TABLE)?;
        Ok(table.get(key)?.map(|guard| guard.value().to_string()))
    }

    fn delete_config(&mut self, key: &str) -> Result<bool> {
        let tx = self.db()?.begin_write()?;
        let existed;
        {
            let mut table = tx.open_table(CONFIG_TABLE)?;
            existed = table.remove(key)?.is_some();
        }
        tx.commit()?;
        Ok(existed)
    }

    fn delete_all_config(&mut self) -> Result<()> {
        let tx = self.db()?.begin_write()?;
        {
            let mut table = tx.open_table(CONFIG_TABLE)?;
            table.retain(|_key, _value| false)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn close(&mut self, delete: bool) -> Result<()> {
        drop(self.db.take());
        if delete && self.path.exists() {
            std::fs::remove_file(&self.path)
                .with_context(|| format!("failed to delete {}", self.path.display()))?;
        }
        Ok(())
    }
}
