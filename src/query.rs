//! Queries over the documents of a workspace.

use serde::{Deserialize, Serialize};

use crate::document::Document;

/// Whether a query folds each path down to its winning version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum History {
    /// Only the latest live document per path.
    #[default]
    Latest,
    /// Every live version, one per `(path, author)` slot.
    All,
}

/// Pagination cursor: results continue strictly after this position in
/// history order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Path of the last document of the previous page.
    pub path: String,
    /// Timestamp of the last document of the previous page.
    pub timestamp: u64,
    /// Signature of the last document of the previous page.
    pub signature: String,
}

impl From<&Document> for Cursor {
    fn from(doc: &Document) -> Self {
        Cursor {
            path: doc.path.clone(),
            timestamp: doc.timestamp,
            signature: doc.signature.clone(),
        }
    }
}

impl Cursor {
    /// Whether `doc` lies strictly after this cursor in history order.
    pub fn precedes(&self, doc: &Document) -> bool {
        let ord = self
            .path
            .cmp(&doc.path)
            .then_with(|| doc.timestamp.cmp(&self.timestamp))
            .then_with(|| doc.signature.cmp(&self.signature));
        ord == std::cmp::Ordering::Less
    }
}

/// A sparse set of selectors; unset selectors do not constrain.
///
/// Build with chained setters:
///
/// ```
/// use tidepool::{History, Query};
///
/// let query = Query::all()
///     .path_prefix("/wiki/")
///     .history(History::All)
///     .limit(20);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    /// Exact path match.
    pub path: Option<String>,
    /// Path starts with this string.
    pub path_prefix: Option<String>,
    /// Exact author match.
    pub author: Option<crate::AuthorId>,
    /// Exact timestamp match.
    pub timestamp: Option<u64>,
    /// Timestamp strictly greater than.
    pub timestamp_gt: Option<u64>,
    /// Timestamp strictly less than.
    pub timestamp_lt: Option<u64>,
    /// Exact content byte length match.
    pub content_size: Option<u64>,
    /// Content byte length strictly greater than.
    pub content_size_gt: Option<u64>,
    /// Content byte length strictly less than.
    pub content_size_lt: Option<u64>,
    /// Latest-per-path fold or full history. Defaults to
    /// [`History::Latest`] when unset.
    pub history: Option<History>,
    /// Cap on the number of returned documents (or paths).
    pub limit: Option<u64>,
    /// Cap on the cumulative UTF-8 content bytes of returned documents.
    pub limit_bytes: Option<u64>,
    /// Return only documents strictly after this cursor in history order.
    pub continue_after: Option<Cursor>,
}

impl Query {
    /// The query that matches every live document.
    pub fn all() -> Self {
        Self::default()
    }

    /// Select an exact path.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Select paths starting with `prefix`.
    pub fn path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefix = Some(prefix.into());
        self
    }

    /// Select a single author.
    pub fn author(mut self, author: crate::AuthorId) -> Self {
        self.author = Some(author);
        self
    }

    /// Select an exact timestamp.
    pub fn timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Select timestamps strictly greater than `bound`.
    pub fn timestamp_gt(mut self, bound: u64) -> Self {
        self.timestamp_gt = Some(bound);
        self
    }

    /// Select timestamps strictly less than `bound`.
    pub fn timestamp_lt(mut self, bound: u64) -> Self {
        self.timestamp_lt = Some(bound);
        self
    }

    /// Select an exact content byte length.
    pub fn content_size(mut self, size: u64) -> Self {
        self.content_size = Some(size);
        self
    }

    /// Select content byte lengths strictly greater than `bound`.
    pub fn content_size_gt(mut self, bound: u64) -> Self {
        self.content_size_gt = Some(bound);
        self
    }

    /// Select content byte lengths strictly less than `bound`.
    pub fn content_size_lt(mut self, bound: u64) -> Self {
        self.content_size_lt = Some(bound);
        self
    }

    /// Fold to the latest version per path, or keep every version.
    pub fn history(mut self, history: History) -> Self {
        self.history = Some(history);
        self
    }

    /// Cap the number of returned documents (or paths).
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Cap the cumulative content bytes of returned documents.
    pub fn limit_bytes(mut self, limit_bytes: u64) -> Self {
        self.limit_bytes = Some(limit_bytes);
        self
    }

    /// Continue a previous listing strictly after `cursor`.
    pub fn continue_after(mut self, cursor: Cursor) -> Self {
        self.continue_after = Some(cursor);
        self
    }

    /// Canonicalize the query: apply defaults and detect selector
    /// combinations that can never match.
    pub fn clean_up(mut self) -> CleanQuery {
        self.history = Some(self.history.unwrap_or_default());

        let mut matches_nothing = false;
        if let (Some(path), Some(prefix)) = (&self.path, &self.path_prefix) {
            if !path.starts_with(prefix.as_str()) {
                matches_nothing = true;
            }
        }
        if empty_exact(self.timestamp, self.timestamp_gt, self.timestamp_lt)
            || empty_range(self.timestamp_gt, self.timestamp_lt)
        {
            matches_nothing = true;
        }
        if empty_exact(self.content_size, self.content_size_gt, self.content_size_lt)
            || empty_range(self.content_size_gt, self.content_size_lt)
        {
            matches_nothing = true;
        }
        if self.limit == Some(0) || self.limit_bytes == Some(0) {
            matches_nothing = true;
        }

        CleanQuery {
            query: self,
            matches_nothing,
        }
    }

    /// Whether `doc` satisfies every set selector.
    ///
    /// `history`, limits and the cursor are not part of the predicate; they
    /// are applied by the evaluation pipeline.
    pub fn matches(&self, doc: &Document) -> bool {
        if let Some(path) = &self.path {
            if doc.path != *path {
                return false;
            }
        }
        if let Some(prefix) = &self.path_prefix {
            if !doc.path.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(author) = &self.author {
            if doc.author != *author {
                return false;
            }
        }
        if let Some(timestamp) = self.timestamp {
            if doc.timestamp != timestamp {
                return false;
            }
        }
        if let Some(bound) = self.timestamp_gt {
            if doc.timestamp <= bound {
                return false;
            }
        }
        if let Some(bound) = self.timestamp_lt {
            if doc.timestamp >= bound {
                return false;
            }
        }
        let size = doc.content_size();
        if let Some(expected) = self.content_size {
            if size != expected {
                return false;
            }
        }
        if let Some(bound) = self.content_size_gt {
            if size <= bound {
                return false;
            }
        }
        if let Some(bound) = self.content_size_lt {
            if size >= bound {
                return false;
            }
        }
        true
    }
}

/// An exact selector outside its own strict bounds can never match.
fn empty_exact(exact: Option<u64>, gt: Option<u64>, lt: Option<u64>) -> bool {
    match exact {
        None => false,
        Some(value) => {
            matches!(gt, Some(bound) if value <= bound) || matches!(lt, Some(bound) if value >= bound)
        }
    }
}

/// Strict bounds with no integer between them select nothing.
fn empty_range(gt: Option<u64>, lt: Option<u64>) -> bool {
    match (gt, lt) {
        (Some(gt), Some(lt)) => gt.saturating_add(1) >= lt,
        _ => false,
    }
}

/// A canonicalized query, as produced by [`Query::clean_up`].
#[derive(Debug, Clone)]
pub struct CleanQuery {
    /// The query with defaults applied (`history` is always set).
    pub query: Query,
    /// The selectors contradict each other; the result is empty.
    pub matches_nothing: bool,
}

/// Truncate `docs` so the cumulative content byte length stays within
/// `limit_bytes`.
///
/// Stops before the document that would push the total past the limit. A
/// tombstone landing exactly at the limit is also excluded, so a listing
/// never ends in a tail of zero-byte documents.
pub(crate) fn truncate_by_bytes(docs: &mut Vec<Document>, limit_bytes: u64) {
    let mut total: u64 = 0;
    let mut keep = 0;
    for doc in docs.iter() {
        let size = doc.content_size();
        if total + size > limit_bytes {
            break;
        }
        if doc.is_tombstone() && total == limit_bytes {
            break;
        }
        total += size;
        keep += 1;
    }
    docs.truncate(keep);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;

    fn doc(path: &str, timestamp: u64, content: &str, signature: &str) -> Document {
        Document {
            format: "tp.1".to_string(),
            workspace: crate::WorkspaceSecret::new(&mut rand::thread_rng()).id(),
            path: path.to_string(),
            content: content.to_string(),
            content_hash: Document::hash_content(content),
            author: crate::Author::new(&mut rand::thread_rng()).id(),
            timestamp,
            delete_after: None,
            signature: signature.to_string(),
        }
    }

    #[test]
    fn clean_up_defaults_history_to_latest() {
        let clean = Query::all().clean_up();
        assert_eq!(clean.query.history, Some(History::Latest));
        assert!(!clean.matches_nothing);

        let clean = Query::all().history(History::All).clean_up();
        assert_eq!(clean.query.history, Some(History::All));
    }

    #[test]
    fn clean_up_detects_contradictions() {
        assert!(Query::all().path("/a").path_prefix("/b").clean_up().matches_nothing);
        assert!(!Query::all().path("/b/c").path_prefix("/b").clean_up().matches_nothing);
        assert!(Query::all().timestamp(5).timestamp_gt(5).clean_up().matches_nothing);
        assert!(Query::all().timestamp(5).timestamp_lt(5).clean_up().matches_nothing);
        assert!(Query::all().timestamp_gt(4).timestamp_lt(5).clean_up().matches_nothing);
        assert!(!Query::all().timestamp_gt(4).timestamp_lt(6).clean_up().matches_nothing);
        assert!(Query::all().content_size(2).content_size_lt(2).clean_up().matches_nothing);
        assert!(Query::all().limit(0).clean_up().matches_nothing);
        assert!(Query::all().limit_bytes(0).clean_up().matches_nothing);
    }

    #[test]
    fn predicate_selectors() {
        let d = doc("/blog/one", 100, "hello", "sig");
        assert!(Query::all().matches(&d));
        assert!(Query::all().path("/blog/one").matches(&d));
        assert!(!Query::all().path("/blog").matches(&d));
        assert!(Query::all().path_prefix("/blog/").matches(&d));
        assert!(!Query::all().path_prefix("/wiki/").matches(&d));
        assert!(Query::all().timestamp(100).matches(&d));
        assert!(Query::all().timestamp_gt(99).timestamp_lt(101).matches(&d));
        assert!(!Query::all().timestamp_gt(100).matches(&d));
        assert!(!Query::all().timestamp_lt(100).matches(&d));
        assert!(Query::all().content_size(5).matches(&d));
        assert!(Query::all().content_size_gt(0).matches(&d));
        assert!(!Query::all().content_size_gt(5).matches(&d));
        assert!(!Query::all().content_size_lt(5).matches(&d));
    }

    #[test]
    fn cursor_is_strictly_greater_in_history_order() {
        let first = doc("/a", 20, "x", "bbb");
        let second = doc("/a", 20, "x", "aaa");
        let third = doc("/a", 10, "x", "zzz");
        let fourth = doc("/b", 99, "x", "mmm");

        let cursor = Cursor::from(&second);
        assert!(!cursor.precedes(&first));
        assert!(!cursor.precedes(&second));
        assert!(cursor.precedes(&third));
        assert!(cursor.precedes(&fourth));
    }

    #[test]
    fn byte_limit_stops_before_overflow() {
        let mut docs = vec![
            doc("/a", 5, "", "e"),
            doc("/b", 4, "1", "d"),
            doc("/c", 3, "22", "c"),
            doc("/d", 2, "", "b"),
            doc("/e", 1, "333", "a"),
        ];
        truncate_by_bytes(&mut docs, 3);
        // 0 + 1 + 2 == 3; the zero-byte tail at the limit is excluded.
        assert_eq!(docs.len(), 3);

        let mut docs = vec![doc("/a", 1, "12345", "a")];
        truncate_by_bytes(&mut docs, 3);
        assert!(docs.is_empty());

        let mut docs = vec![doc("/a", 1, "", "a"), doc("/b", 1, "1234", "b")];
        truncate_by_bytes(&mut docs, 3);
        // A leading tombstone fits under the limit.
        assert_eq!(docs.len(), 1);
    }
}
