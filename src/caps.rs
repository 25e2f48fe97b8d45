//! Capability values and their string grammar.
//!
//! A capability is an opaque, self-certifying token identifying a remote
//! object: a mutable directory (`dirw`), a readonly view of one (`dirr`), or
//! an immutable file (`file`). Capabilities serialize to a kind prefix
//! followed by the lowercase base32 encoding of a 32-byte payload, e.g.
//! `dirw2nvterdh...`. They are immutable values compared by equality.
//!
//! A readonly capability is derived from a read-write one by hashing the
//! write key; the reverse direction would require a preimage and is
//! infeasible.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Separator between the two capability strings of an invite token.
///
/// `+` does not occur in a capability's serialization (kind prefixes are
/// lowercase ascii letters, payloads are base32), so splitting on the last
/// occurrence is unambiguous.
pub const INVITE_SEPARATOR: char = '+';

/// The kind of remote object a capability grants access to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display,
)]
pub enum CapKind {
    /// Read-write access to a mutable directory.
    #[display("dirw")]
    DirWrite,
    /// Readonly access to a mutable directory.
    #[display("dirr")]
    DirRead,
    /// An immutable, content-addressed file.
    #[display("file")]
    File,
}

impl CapKind {
    const ALL: [CapKind; 3] = [CapKind::DirWrite, CapKind::DirRead, CapKind::File];

    fn prefix(&self) -> &'static str {
        match self {
            CapKind::DirWrite => "dirw",
            CapKind::DirRead => "dirr",
            CapKind::File => "file",
        }
    }
}

/// An unforgeable token granting access to a specific remote object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Capability {
    kind: CapKind,
    bytes: [u8; 32],
}

impl Capability {
    /// Creates a capability from its kind and raw payload.
    ///
    /// Capabilities are normally minted by the storage grid; this is the
    /// constructor the grid side uses.
    pub fn from_parts(kind: CapKind, bytes: [u8; 32]) -> Self {
        Capability { kind, bytes }
    }

    /// The kind of object this capability refers to.
    pub fn kind(&self) -> CapKind {
        self.kind
    }

    /// The raw 32-byte payload.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    /// Derives the readonly capability for a directory write capability.
    ///
    /// Deterministic and purely local: the read key is the blake3 hash of
    /// the write key, so the derivation is one-way. Fails with
    /// [`MalformedCapability::NotAWriteCap`] for any other kind.
    pub fn diminish(&self) -> Result<Capability, MalformedCapability> {
        match self.kind {
            CapKind::DirWrite => Ok(Capability {
                kind: CapKind::DirRead,
                bytes: *blake3::hash(&self.bytes).as_bytes(),
            }),
            _ => Err(MalformedCapability::NotAWriteCap),
        }
    }

    /// True if this capability grants write access to a directory.
    pub fn is_writable_dir(&self) -> bool {
        self.kind == CapKind::DirWrite
    }

    /// Short printable form for logging, prefix plus a few payload chars.
    pub fn fmt_short(&self) -> String {
        let s = self.to_string();
        s[..s.len().min(12)].to_string()
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = self.kind.prefix().to_string();
        data_encoding::BASE32_NOPAD.encode_append(&self.bytes, &mut out);
        write!(f, "{}", out.to_ascii_lowercase())
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Capability({})", self.fmt_short())
    }
}

impl FromStr for Capability {
    type Err = MalformedCapability;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, rest) = CapKind::ALL
            .iter()
            .find_map(|kind| s.strip_prefix(kind.prefix()).map(|rest| (*kind, rest)))
            .ok_or(MalformedCapability::UnknownPrefix)?;
        let decoded = data_encoding::BASE32_NOPAD
            .decode(rest.to_ascii_uppercase().as_bytes())
            .map_err(|_| MalformedCapability::Encoding)?;
        let bytes: [u8; 32] = decoded
            .try_into()
            .map_err(|v: Vec<u8>| MalformedCapability::Length(v.len()))?;
        Ok(Capability { kind, bytes })
    }
}

/// A capability or invite token that does not match the expected grammar.
///
/// Always surfaced to the caller, never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MalformedCapability {
    /// The string does not start with a known capability kind.
    #[error("unknown capability prefix")]
    UnknownPrefix,
    /// The payload is not valid base32.
    #[error("capability payload is not valid base32")]
    Encoding,
    /// The decoded payload has the wrong length.
    #[error("capability payload must be 32 bytes, got {0}")]
    Length(usize),
    /// Diminishment is only defined for directory write capabilities.
    #[error("expected a directory write capability")]
    NotAWriteCap,
    /// An invite token without the `+` separator.
    #[error("invite token is missing the '+' separator")]
    MissingSeparator,
    /// An invite token whose halves have the wrong capability kinds.
    #[error("invite token halves have the wrong capability kinds")]
    InviteKinds,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(kind: CapKind, byte: u8) -> Capability {
        Capability::from_parts(kind, [byte; 32])
    }

    #[test]
    fn roundtrip() {
        for kind in CapKind::ALL {
            let cap = sample(kind, 7);
            let s = cap.to_string();
            assert!(s.starts_with(kind.prefix()));
            let parsed: Capability = s.parse().unwrap();
            assert_eq!(parsed, cap);
        }
    }

    #[test]
    fn serialization_has_no_separator() {
        let cap = sample(CapKind::DirWrite, 0xff);
        assert!(!cap.to_string().contains(INVITE_SEPARATOR));
    }

    #[test]
    fn malformed() {
        assert_eq!(
            "bogus".parse::<Capability>(),
            Err(MalformedCapability::UnknownPrefix)
        );
        assert_eq!(
            "dirw!!!".parse::<Capability>(),
            Err(MalformedCapability::Encoding)
        );
        // valid base32 but too short
        let short = format!("dirw{}", data_encoding::BASE32_NOPAD.encode(&[1, 2, 3]).to_ascii_lowercase());
        assert_eq!(
            short.parse::<Capability>(),
            Err(MalformedCapability::Length(3))
        );
    }

    #[test]
    fn diminish_is_deterministic_and_one_way() {
        let write = sample(CapKind::DirWrite, 3);
        let read = write.diminish().unwrap();
        assert_eq!(read.kind(), CapKind::DirRead);
        assert_eq!(read, write.diminish().unwrap());
        assert_ne!(read.as_bytes(), write.as_bytes());
        // a readonly cap cannot be diminished further, nor "promoted"
        assert_eq!(read.diminish(), Err(MalformedCapability::NotAWriteCap));
    }
}
