//! Keys identifying workspaces and the authors writing into them.

use std::{cmp::Ordering, fmt, str::FromStr};

use ed25519_dalek::{Signature, SignatureError, Signer, SigningKey, VerifyingKey};
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};

/// Author keypair, used to sign the documents it writes.
///
/// Only the author holds the signing half; documents carry the [`AuthorId`].
/// Any number of authors may be created, and their semantic meaning is
/// application-specific.
#[derive(Clone)]
pub struct Author {
    signing_key: SigningKey,
}

impl Author {
    /// Create a new [`Author`] with a random key.
    pub fn new<R: CryptoRngCore + ?Sized>(rng: &mut R) -> Self {
        Author {
            signing_key: SigningKey::generate(rng),
        }
    }

    /// The [`AuthorId`] that documents signed with this key carry.
    pub fn id(&self) -> AuthorId {
        AuthorId(self.signing_key.verifying_key())
    }

    /// Sign a message with this author's key.
    pub fn sign(&self, msg: &[u8]) -> Signature {
        self.signing_key.sign(msg)
    }
}

impl fmt::Debug for Author {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Author({})", self.id())
    }
}

/// Public identifier of an [`Author`], carried by every document it signed.
///
/// Orders by key bytes; the drivers use it as the author half of a
/// `(path, author)` slot key.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorId(VerifyingKey);

impl AuthorId {
    /// Verify that `signature` covers `msg` and was created by the [`Author`]
    /// this id belongs to.
    pub fn verify(&self, msg: &[u8], signature: &Signature) -> Result<(), SignatureError> {
        self.0.verify_strict(msg, signature)
    }

    /// The raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Short form for log output.
    pub fn fmt_short(&self) -> String {
        base32::fmt_short(self.as_bytes())
    }
}

impl PartialOrd for AuthorId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AuthorId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.as_bytes().cmp(other.0.as_bytes())
    }
}

impl fmt::Display for AuthorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", base32::fmt(self.as_bytes()))
    }
}

impl fmt::Debug for AuthorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthorId({})", self)
    }
}

impl FromStr for AuthorId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = base32::parse_array(s)?;
        Ok(AuthorId(VerifyingKey::from_bytes(&bytes)?))
    }
}

/// Secret key of a workspace.
///
/// Its public half is the [`WorkspaceId`], the address a group of peers
/// shares. Creating one is how a new workspace address comes into existence.
#[derive(Clone)]
pub struct WorkspaceSecret {
    signing_key: SigningKey,
}

impl WorkspaceSecret {
    /// Create a new [`WorkspaceSecret`] with a random key.
    pub fn new<R: CryptoRngCore + ?Sized>(rng: &mut R) -> Self {
        WorkspaceSecret {
            signing_key: SigningKey::generate(rng),
        }
    }

    /// The [`WorkspaceId`] of this workspace.
    pub fn id(&self) -> WorkspaceId {
        WorkspaceId(self.signing_key.verifying_key())
    }
}

impl fmt::Debug for WorkspaceSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorkspaceSecret({})", self.id())
    }
}

/// Address of a workspace.
///
/// A store is bound to one address, and every document stored in it carries
/// the same one.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceId(VerifyingKey);

impl WorkspaceId {
    /// The raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Short form for log output.
    pub fn fmt_short(&self) -> String {
        base32::fmt_short(self.as_bytes())
    }
}

impl fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", base32::fmt(self.as_bytes()))
    }
}

impl fmt::Debug for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorkspaceId({})", self)
    }
}

impl FromStr for WorkspaceId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = base32::parse_array(s)?;
        Ok(WorkspaceId(VerifyingKey::from_bytes(&bytes)?))
    }
}

/// Utilities for working with byte array identifiers.
pub(crate) mod base32 {
    /// Convert to a lowercase base32 string.
    pub fn fmt(bytes: impl AsRef<[u8]>) -> String {
        let mut text = data_encoding::BASE32_NOPAD.encode(bytes.as_ref());
        text.make_ascii_lowercase();
        text
    }

    /// Convert to a lowercase base32 string limited to the first 10 characters.
    pub fn fmt_short(bytes: impl AsRef<[u8]>) -> String {
        let mut text = fmt(bytes);
        text.truncate(10);
        text
    }

    /// Parse from a base32 string into a byte array.
    pub fn parse_array<const N: usize>(input: &str) -> anyhow::Result<[u8; N]> {
        data_encoding::BASE32_NOPAD
            .decode(input.to_ascii_uppercase().as_bytes())?
            .try_into()
            .map_err(|_| ::anyhow::anyhow!("Failed to parse: invalid byte length"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base32_roundtrip() {
        let author = Author::new(&mut rand::thread_rng());
        let id = author.id();
        let s = id.to_string();
        let back: AuthorId = s.parse().unwrap();
        assert_eq!(id, back);

        let ws = WorkspaceSecret::new(&mut rand::thread_rng());
        let s = ws.id().to_string();
        let back: WorkspaceId = s.parse().unwrap();
        assert_eq!(ws.id(), back);
    }

    #[test]
    fn author_sign_verify() {
        let author = Author::new(&mut rand::thread_rng());
        let sig = author.sign(b"hello");
        author.id().verify(b"hello", &sig).unwrap();
        assert!(author.id().verify(b"other", &sig).is_err());
    }
}
