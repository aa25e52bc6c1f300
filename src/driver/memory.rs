//! In-memory storage backend.

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;

use crate::{
    document::Document,
    driver::{util, Driver},
    keys::{AuthorId, WorkspaceId},
    query::Query,
};

/// Stores the documents of one workspace in a two-level map,
/// `path -> author -> document`.
///
/// Documents are owned immutable values; queries hand out clones.
#[derive(Debug, Clone, Default)]
pub struct MemoryDriver {
    docs: BTreeMap<String, BTreeMap<AuthorId, Document>>,
    config: HashMap<String, String>,
}

impl MemoryDriver {
    /// Create an empty driver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Candidate documents for `query`: a single path's slots when the query
    /// pins a path, everything otherwise.
    fn candidates(&self, query: &Query) -> Vec<Document> {
        match &query.path {
            Some(path) => self
                .docs
                .get(path)
                .map(|slots| slots.values().cloned().collect())
                .unwrap_or_default(),
            None => self
                .docs
                .values()
                .flat_map(|slots| slots.values().cloned())
                .collect(),
        }
    }

    fn all_docs(&self) -> impl Iterator<Item = Document> + '_ {
        self.docs.values().flat_map(|slots| slots.values().cloned())
    }
}

impl Driver for MemoryDriver {
    fn begin(&mut self, _workspace: &WorkspaceId) -> Result<()> {
        Ok(())
    }

    fn authors(&mut self, now: u64) -> Result<Vec<AuthorId>> {
        Ok(util::collect_authors(self.all_docs(), now))
    }

    fn query_paths(&mut self, query: &Query, now: u64) -> Result<Vec<String>> {
        Ok(util::evaluate_paths(self.candidates(query), query, now))
    }

    fn query_documents(&mut self, query: &Query, now: u64) -> Result<Vec<Document>> {
        Ok(util::evaluate(self.candidates(query), query, now))
    }

    fn upsert_document(&mut self, doc: Document) -> Result<()> {
        self.docs
            .entry(doc.path.clone())
            .or_default()
            .insert(doc.author, doc);
        Ok(())
    }

    fn remove_expired_documents(&mut self, now: u64) -> Result<usize> {
        let mut removed = 0;
        self.docs.retain(|_path, slots| {
            slots.retain(|_author, doc| {
                let keep = !doc.is_expired(now);
                if !keep {
                    removed += 1;
                }
                keep
            });
            !slots.is_empty()
        });
        Ok(removed)
    }

    fn forget_documents(&mut self, query: &Query, now: u64) -> Result<usize> {
        let victims = util::evaluate(self.candidates(query), query, now);
        for doc in &victims {
            if let Some(slots) = self.docs.get_mut(&doc.path) {
                slots.remove(&doc.author);
                if slots.is_empty() {
                    self.docs.remove(&doc.path);
                }
            }
        }
        Ok(victims.len())
    }

    fn set_config(&mut self, key: &str, value: &str) -> Result<()> {
        self.config.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get_config(&mut self, key: &str) -> Result<Option<String>> {
        Ok(self.config.get(key).cloned())
    }

    fn delete_config(&mut self, key: &str) -> Result<bool> {
        Ok(self.config.remove(key).is_some())
    }

    fn delete_all_config(&mut self) -> Result<()> {
        self.config.clear();
        Ok(())
    }

    fn close(&mut self, delete: bool) -> Result<()> {
        if delete {
            self.docs.clear();
            self.config.clear();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Author, WorkspaceSecret};

    fn doc(path: &str, author: &Author, timestamp: u64, content: &str) -> Document {
        Document {
            format: "tp.1".to_string(),
            workspace: WorkspaceSecret::new(&mut rand::thread_rng()).id(),
            path: path.to_string(),
            content: content.to_string(),
            content_hash: Document::hash_content(content),
            author: author.id(),
            timestamp,
            delete_after: None,
            signature: format!("sig-{timestamp}"),
        }
    }

    #[test]
    fn upsert_overwrites_the_slot() {
        let mut rng = rand::thread_rng();
        let alice = Author::new(&mut rng);
        let mut driver = MemoryDriver::new();

        driver.upsert_document(doc("/x", &alice, 10, "one")).unwrap();
        driver.upsert_document(doc("/x", &alice, 20, "two")).unwrap();

        let docs = driver.query_documents(&Query::all(), 0).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].content, "two");
    }

    #[test]
    fn single_path_queries_only_touch_that_path() {
        let mut rng = rand::thread_rng();
        let alice = Author::new(&mut rng);
        let mut driver = MemoryDriver::new();
        driver.upsert_document(doc("/a", &alice, 1, "a")).unwrap();
        driver.upsert_document(doc("/b", &alice, 2, "b")).unwrap();

        let docs = driver
            .query_documents(&Query::all().path("/a"), 0)
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].path, "/a");
    }

    #[test]
    fn expiry_sweep_reclaims_and_counts() {
        let mut rng = rand::thread_rng();
        let alice = Author::new(&mut rng);
        let mut driver = MemoryDriver::new();

        let mut ephemeral = doc("/e!", &alice, 10, "x");
        ephemeral.delete_after = Some(100);
        driver.upsert_document(ephemeral).unwrap();
        driver.upsert_document(doc("/keep", &alice, 10, "y")).unwrap();

        assert_eq!(driver.remove_expired_documents(50).unwrap(), 0);
        assert_eq!(driver.remove_expired_documents(150).unwrap(), 1);
        let docs = driver.query_documents(&Query::all(), 150).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].path, "/keep");
    }

    #[test]
    fn forget_removes_matching_documents() {
        let mut rng = rand::thread_rng();
        let alice = Author::new(&mut rng);
        let mut driver = MemoryDriver::new();
        driver.upsert_document(doc("/blog/a", &alice, 1, "a")).unwrap();
        driver.upsert_document(doc("/blog/b", &alice, 2, "b")).unwrap();
        driver.upsert_document(doc("/wiki/c", &alice, 3, "c")).unwrap();

        let removed = driver
            .forget_documents(&Query::all().path_prefix("/blog/"), 0)
            .unwrap();
        assert_eq!(removed, 2);
        let paths = driver.query_paths(&Query::all(), 0).unwrap();
        assert_eq!(paths, vec!["/wiki/c"]);
    }

    #[test]
    fn config_round_trip() {
        let mut driver = MemoryDriver::new();
        assert_eq!(driver.get_config("k").unwrap(), None);
        driver.set_config("k", "v").unwrap();
        assert_eq!(driver.get_config("k").unwrap(), Some("v".to_string()));
        assert!(driver.delete_config("k").unwrap());
        assert!(!driver.delete_config("k").unwrap());
        driver.set_config("a", "1").unwrap();
        driver.set_config("b", "2").unwrap();
        driver.delete_all_config().unwrap();
        assert_eq!(driver.get_config("a").unwrap(), None);
    }
}
