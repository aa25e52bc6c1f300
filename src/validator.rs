//! Document format validators.
//!
//! A validator is the capability that decides whether a document is
//! well-formed and produces signatures for locally authored documents. The
//! store treats validators as black boxes and dispatches on the document's
//! `format` field.

use std::fmt::Debug;

use ed25519_dalek::Signature;

use crate::{
    document::Document,
    keys::{base32, Author, WorkspaceId},
};

/// Maximum acceptable timestamp, in microseconds.
///
/// Kept within 2^53 so timestamps survive round-trips through systems that
/// represent integers as IEEE doubles.
pub const MAX_TIMESTAMP: u64 = (1 << 53) - 1;

/// How far into the future of local time a document timestamp may lie.
pub const MAX_CLOCK_DRIFT: u64 = 10 * 60 * 1_000_000;

/// Maximum byte length of a document path.
pub const MAX_PATH_LENGTH: usize = 512;

/// Errors raised when a document, workspace or timestamp is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// No validator is registered for the document's format.
    #[error("no validator for format {0:?}")]
    UnknownFormat(String),
    /// A store was constructed without any validators.
    #[error("at least one validator is required")]
    NoValidators,
    /// The document is addressed to a different workspace than the store's.
    #[error("document for workspace {actual} cannot be stored in workspace {expected}")]
    WrongWorkspace {
        /// The workspace of the store.
        expected: WorkspaceId,
        /// The workspace the document was addressed to.
        actual: WorkspaceId,
    },
    /// The workspace address was rejected.
    #[error("invalid workspace: {0}")]
    InvalidWorkspace(String),
    /// The document path violates the path grammar.
    #[error("invalid path: {0}")]
    InvalidPath(String),
    /// The timestamp or expiry is out of bounds.
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
    /// The document's expiry instant has already passed.
    #[error("ephemeral document expired at {delete_after}, now is {now}")]
    Expired {
        /// The expiry instant of the document.
        delete_after: u64,
        /// The clock value the check ran against.
        now: u64,
    },
    /// The content hash does not match the content.
    #[error("content hash does not match content")]
    ContentHashMismatch,
    /// The signature is malformed or does not verify.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
    /// A signing keypair does not match the document's author field.
    #[error("document author {expected} does not match signing keypair {actual}")]
    AuthorMismatch {
        /// The author named in the document.
        expected: crate::AuthorId,
        /// The id of the keypair that was asked to sign.
        actual: crate::AuthorId,
    },
}

/// Checks document well-formedness and signs unsigned documents.
///
/// One validator handles one `format`. A store holds one or more validators
/// and refuses documents whose format none of them claims.
pub trait Validator: Debug + Send + Sync + 'static {
    /// The format identifier this validator handles.
    fn format(&self) -> &'static str;

    /// Check that a signed document is acceptable at time `now`.
    fn check_document_is_valid(&self, doc: &Document, now: u64) -> Result<(), ValidationError>;

    /// Check that a workspace address is acceptable to this format.
    fn check_workspace_is_valid(&self, workspace: &WorkspaceId) -> Result<(), ValidationError>;

    /// Check that a timestamp (and optional expiry) is within bounds at `now`.
    fn check_timestamp_is_ok(
        &self,
        timestamp: u64,
        delete_after: Option<u64>,
        now: u64,
    ) -> Result<(), ValidationError>;

    /// Sign `doc` with `keypair`, filling in the signature field.
    fn sign_document(&self, keypair: &Author, doc: Document) -> Result<Document, ValidationError>;
}

/// The ed25519 document format, `"tp.1"`.
///
/// Signatures are ed25519 over [`Document::signing_bytes`], carried as
/// lowercase base32. Content is bound through its SHA-256 hash.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Validator;

impl Ed25519Validator {
    /// The format identifier of this validator.
    pub const FORMAT: &'static str = "tp.1";
}

impl Validator for Ed25519Validator {
    fn format(&self) -> &'static str {
        Self::FORMAT
    }

    fn check_document_is_valid(&self, doc: &Document, now: u64) -> Result<(), ValidationError> {
        if doc.format != Self::FORMAT {
            return Err(ValidationError::UnknownFormat(doc.format.clone()));
        }
        check_path(&doc.path, doc.is_ephemeral())?;
        self.check_timestamp_is_ok(doc.timestamp, doc.delete_after, now)?;
        if doc.content_hash != Document::hash_content(&doc.content) {
            return Err(ValidationError::ContentHashMismatch);
        }
        let sig_bytes: [u8; 64] = base32::parse_array(&doc.signature)
            .map_err(|_| ValidationError::InvalidSignature("not 64 base32 bytes".into()))?;
        let signature = Signature::from_bytes(&sig_bytes);
        doc.author
            .verify(&doc.signing_bytes(), &signature)
            .map_err(|err| ValidationError::InvalidSignature(err.to_string()))?;
        Ok(())
    }

    fn check_workspace_is_valid(&self, _workspace: &WorkspaceId) -> Result<(), ValidationError> {
        // Workspace addresses are curve points by construction.
        Ok(())
    }

    fn check_timestamp_is_ok(
        &self,
        timestamp: u64,
        delete_after: Option<u64>,
        now: u64,
    ) -> Result<(), ValidationError> {
        if timestamp == 0 {
            return Err(ValidationError::InvalidTimestamp("timestamp is zero".into()));
        }
        if timestamp > MAX_TIMESTAMP {
            return Err(ValidationError::InvalidTimestamp(format!(
                "timestamp {timestamp} exceeds maximum {MAX_TIMESTAMP}"
            )));
        }
        if timestamp > now.saturating_add(MAX_CLOCK_DRIFT) {
            return Err(ValidationError::InvalidTimestamp(format!(
                "timestamp {timestamp} is too far in the future of {now}"
            )));
        }
        if let Some(delete_after) = delete_after {
            if delete_after <= timestamp {
                return Err(ValidationError::InvalidTimestamp(format!(
                    "expiry {delete_after} is not after timestamp {timestamp}"
                )));
            }
            if delete_after > MAX_TIMESTAMP {
                return Err(ValidationError::InvalidTimestamp(format!(
                    "expiry {delete_after} exceeds maximum {MAX_TIMESTAMP}"
                )));
            }
            if delete_after < now {
                return Err(ValidationError::Expired { delete_after, now });
            }
        }
        Ok(())
    }

    fn sign_document(&self, keypair: &Author, mut doc: Document) -> Result<Document, ValidationError> {
        if doc.format != Self::FORMAT {
            return Err(ValidationError::UnknownFormat(doc.format.clone()));
        }
        if doc.author != keypair.id() {
            return Err(ValidationError::AuthorMismatch {
                expected: doc.author,
                actual: keypair.id(),
            });
        }
        check_path(&doc.path, doc.is_ephemeral())?;
        let signature = keypair.sign(&doc.signing_bytes());
        doc.signature = base32::fmt(signature.to_bytes());
        Ok(doc)
    }
}

/// The characters a path may contain besides ASCII alphanumerics.
const PATH_PUNCTUATION: &str = "/'()-._~!*$&+,:=@%";

/// The marker character that ephemeral paths must carry.
const EPHEMERAL_MARKER: char = '!';

fn check_path(path: &str, ephemeral: bool) -> Result<(), ValidationError> {
    if path.len() < 2 || path.len() > MAX_PATH_LENGTH {
        return Err(ValidationError::InvalidPath(format!(
            "path must be 2..={MAX_PATH_LENGTH} bytes, got {}",
            path.len()
        )));
    }
    if !path.starts_with('/') {
        return Err(ValidationError::InvalidPath("path must start with '/'".into()));
    }
    if path.contains("//") {
        return Err(ValidationError::InvalidPath("path must not contain '//'".into()));
    }
    if let Some(bad) = path
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && !PATH_PUNCTUATION.contains(*c))
    {
        return Err(ValidationError::InvalidPath(format!(
            "path contains disallowed character {bad:?}"
        )));
    }
    // The marker makes ephemerality legible from the path alone, so peers
    // can treat ephemeral subtrees differently without parsing documents.
    let has_marker = path.contains(EPHEMERAL_MARKER);
    if ephemeral && !has_marker {
        return Err(ValidationError::InvalidPath(
            "ephemeral documents need a '!' in their path".into(),
        ));
    }
    if !ephemeral && has_marker {
        return Err(ValidationError::InvalidPath(
            "only ephemeral documents may have a '!' in their path".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WorkspaceSecret;

    fn signed_doc(author: &Author, workspace: WorkspaceId) -> Document {
        let doc = Document {
            format: Ed25519Validator::FORMAT.to_string(),
            workspace,
            path: "/test/doc".to_string(),
            content: "hello".to_string(),
            content_hash: Document::hash_content("hello"),
            author: author.id(),
            timestamp: 10_000,
            delete_after: None,
            signature: String::new(),
        };
        Ed25519Validator.sign_document(author, doc).unwrap()
    }

    #[test]
    fn sign_and_check() {
        let mut rng = rand::thread_rng();
        let author = Author::new(&mut rng);
        let workspace = WorkspaceSecret::new(&mut rng).id();
        let doc = signed_doc(&author, workspace);
        Ed25519Validator
            .check_document_is_valid(&doc, 10_000)
            .unwrap();
    }

    #[test]
    fn tampering_breaks_the_signature() {
        let mut rng = rand::thread_rng();
        let author = Author::new(&mut rng);
        let workspace = WorkspaceSecret::new(&mut rng).id();

        let mut doc = signed_doc(&author, workspace);
        doc.content = "bye".to_string();
        doc.content_hash = Document::hash_content("bye");
        assert!(matches!(
            Ed25519Validator.check_document_is_valid(&doc, 10_000),
            Err(ValidationError::InvalidSignature(_))
        ));

        let mut doc = signed_doc(&author, workspace);
        doc.content = "bye".to_string();
        assert_eq!(
            Ed25519Validator.check_document_is_valid(&doc, 10_000),
            Err(ValidationError::ContentHashMismatch)
        );
    }

    #[test]
    fn signing_with_the_wrong_keypair_is_refused() {
        let mut rng = rand::thread_rng();
        let author = Author::new(&mut rng);
        let other = Author::new(&mut rng);
        let workspace = WorkspaceSecret::new(&mut rng).id();
        let doc = Document {
            format: Ed25519Validator::FORMAT.to_string(),
            workspace,
            path: "/a".to_string(),
            content: String::new(),
            content_hash: Document::hash_content(""),
            author: author.id(),
            timestamp: 1,
            delete_after: None,
            signature: String::new(),
        };
        assert!(matches!(
            Ed25519Validator.sign_document(&other, doc),
            Err(ValidationError::AuthorMismatch { .. })
        ));
    }

    #[test]
    fn timestamp_bounds() {
        let v = Ed25519Validator;
        let now = 1_000_000;
        assert!(v.check_timestamp_is_ok(1, None, now).is_ok());
        assert!(v.check_timestamp_is_ok(0, None, now).is_err());
        assert!(v.check_timestamp_is_ok(MAX_TIMESTAMP + 1, None, now).is_err());
        // Small future drift is fine, large is not.
        assert!(v.check_timestamp_is_ok(now + 1_000, None, now).is_ok());
        assert!(v
            .check_timestamp_is_ok(now + MAX_CLOCK_DRIFT + 1, None, now)
            .is_err());
        // Expiry must lie after the timestamp and must not already be past.
        assert!(v.check_timestamp_is_ok(500, Some(400), now).is_err());
        assert_eq!(
            v.check_timestamp_is_ok(500, Some(600), now),
            Err(ValidationError::Expired {
                delete_after: 600,
                now
            })
        );
        assert!(v
            .check_timestamp_is_ok(now, Some(now + 1_000), now)
            .is_ok());
    }

    #[test]
    fn path_grammar() {
        assert!(check_path("/a", false).is_ok());
        assert!(check_path("/about/~author/profile.json", false).is_ok());
        assert!(check_path("a", false).is_err());
        assert!(check_path("/", false).is_err());
        assert!(check_path("/a//b", false).is_err());
        assert!(check_path("/with space", false).is_err());
        // '!' marks ephemeral paths, both directions.
        assert!(check_path("/chat/msg!", true).is_ok());
        assert!(check_path("/chat/msg", true).is_err());
        assert!(check_path("/chat/msg!", false).is_err());
    }
}
