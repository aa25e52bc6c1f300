//! The signed document record and its ordering.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::keys::{base32, AuthorId, WorkspaceId};

/// A single document in a workspace.
///
/// Documents are immutable once signed. At most one document exists per
/// `(path, author)` slot; a slot is superseded by a later write with a greater
/// `(timestamp, signature)` pair. An empty `content` is an ordinary value and
/// acts as a tombstone for the path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Identifier of the validator format this document was signed with.
    pub format: String,
    /// Address of the workspace this document belongs to.
    pub workspace: WorkspaceId,
    /// Hierarchical identifier of the document within its workspace.
    pub path: String,
    /// UTF-8 content. The empty string marks a deleted path.
    pub content: String,
    /// Lowercase base32 SHA-256 digest of `content`, bound by the signature.
    pub content_hash: String,
    /// The author that wrote this document.
    pub author: AuthorId,
    /// Creation timestamp in microseconds since the Unix epoch.
    pub timestamp: u64,
    /// Expiry instant in microseconds since the Unix epoch, if the document
    /// is ephemeral.
    pub delete_after: Option<u64>,
    /// Author signature over the canonical bytes, as lowercase base32.
    pub signature: String,
}

impl Document {
    /// Whether this document carries an expiry instant.
    pub fn is_ephemeral(&self) -> bool {
        self.delete_after.is_some()
    }

    /// Whether this document is expired at `now`.
    ///
    /// A document is live while `now <= delete_after` and expired strictly
    /// afterwards.
    pub fn is_expired(&self, now: u64) -> bool {
        matches!(self.delete_after, Some(t) if t < now)
    }

    /// Whether this document marks its path as deleted.
    pub fn is_tombstone(&self) -> bool {
        self.content.is_empty()
    }

    /// Byte length of the UTF-8 encoded content.
    pub fn content_size(&self) -> u64 {
        self.content.len() as u64
    }

    /// Whether this document wins over `other` in the same slot.
    pub fn supersedes(&self, other: &Document) -> bool {
        (self.timestamp, self.signature.as_str()) > (other.timestamp, other.signature.as_str())
    }

    /// The canonical byte representation that is signed.
    ///
    /// All fields except the signature itself are covered. The variable-length
    /// fields are newline-separated; none of them may contain a newline.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            32 + 32 + 8 + 8 + self.format.len() + self.path.len() + self.content_hash.len() + 2,
        );
        out.extend_from_slice(self.workspace.as_bytes());
        out.extend_from_slice(self.author.as_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.delete_after.unwrap_or(0).to_be_bytes());
        out.extend_from_slice(self.format.as_bytes());
        out.push(b'\n');
        out.extend_from_slice(self.path.as_bytes());
        out.push(b'\n');
        out.extend_from_slice(self.content_hash.as_bytes());
        out
    }

    /// Compute the content hash for `content`: lowercase base32 of SHA-256.
    pub fn hash_content(content: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        base32::fmt(hasher.finalize())
    }
}

/// Input to [`Store::set`](crate::Store::set): the caller-controlled fields of
/// a document before it is completed and signed by the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentDraft {
    /// Validator format to sign with.
    pub format: String,
    /// Path to write to.
    pub path: String,
    /// UTF-8 content. Write the empty string to delete the path.
    pub content: String,
    /// Timestamp in microseconds. `None` (or `0`) asks the store to assign
    /// one, bumping past the current latest document at the path.
    pub timestamp: Option<u64>,
    /// Expiry instant in microseconds for ephemeral documents.
    pub delete_after: Option<u64>,
}

/// History order: `path ASC, timestamp DESC, signature DESC`.
///
/// Within one path the winning version sorts first. This is the order of all
/// document listings. The other order of the system, `path ASC, author ASC`,
/// is the storage order itself: both drivers keep their slots keyed by
/// `(path, author)`.
pub fn cmp_history_order(a: &Document, b: &Document) -> Ordering {
    a.path
        .cmp(&b.path)
        .then_with(|| b.timestamp.cmp(&a.timestamp))
        .then_with(|| b.signature.cmp(&a.signature))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(path: &str, timestamp: u64, signature: &str) -> Document {
        let author = crate::Author::new(&mut rand::thread_rng());
        Document {
            format: "tp.1".to_string(),
            workspace: crate::WorkspaceSecret::new(&mut rand::thread_rng()).id(),
            path: path.to_string(),
            content: "x".to_string(),
            content_hash: Document::hash_content("x"),
            author: author.id(),
            timestamp,
            delete_after: None,
            signature: signature.to_string(),
        }
    }

    #[test]
    fn content_hash_is_stable() {
        assert_eq!(Document::hash_content(""), Document::hash_content(""));
        assert_ne!(Document::hash_content(""), Document::hash_content("a"));
        // 32 bytes of SHA-256 in base32 without padding.
        assert_eq!(Document::hash_content("hello").len(), 52);
    }

    #[test]
    fn history_order_sorts_winner_first() {
        let a = doc("/a", 10, "aaa");
        let b = doc("/a", 20, "aaa");
        let c = doc("/a", 20, "bbb");
        let d = doc("/b", 5, "zzz");

        let mut docs = vec![a.clone(), b.clone(), c.clone(), d.clone()];
        docs.sort_by(cmp_history_order);
        assert_eq!(docs, vec![c.clone(), b.clone(), a.clone(), d.clone()]);

        assert!(c.supersedes(&b));
        assert!(b.supersedes(&a));
        assert!(!a.supersedes(&b));
    }

    #[test]
    fn expiry_boundary_is_inclusive() {
        let mut d = doc("/a", 10, "aaa");
        d.delete_after = Some(100);
        assert!(!d.is_expired(99));
        assert!(!d.is_expired(100));
        assert!(d.is_expired(101));
    }

    #[test]
    fn signing_bytes_change_with_every_field() {
        let base = doc("/a", 10, "aaa");
        let bytes = base.signing_bytes();

        let mut other = base.clone();
        other.timestamp = 11;
        assert_ne!(bytes, other.signing_bytes());

        let mut other = base.clone();
        other.delete_after = Some(12);
        assert_ne!(bytes, other.signing_bytes());

        let mut other = base.clone();
        other.path = "/b".to_string();
        assert_ne!(bytes, other.signing_bytes());

        let mut other = base.clone();
        other.content_hash = Document::hash_content("y");
        assert_ne!(bytes, other.signing_bytes());

        // The signature itself is not covered.
        let mut other = base.clone();
        other.signature = "different".to_string();
        assert_eq!(bytes, other.signing_bytes());
    }
}
