//! Content digests used as Blob Store addresses.
//!
//! A digest is rendered as `{algorithm}:{lowercase hex}`, e.g.
//! `sha256:9f86d0...`. The algorithm prefix keeps blobs written under one
//! configuration addressable after the configured algorithm changes.

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use sqlx::{
    Database, Decode, Encode, Sqlite, Type,
    encode::IsNull,
    error::BoxDynError,
    sqlite::SqliteTypeInfo,
};
use std::{fmt, str::FromStr};

/// Hash function used to derive content addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    Sha256,
    Md5,
}

impl DigestAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Md5 => "md5",
        }
    }

    /// Length of the hex-encoded digest.
    pub fn hex_len(&self) -> usize {
        match self {
            Self::Sha256 => 64,
            Self::Md5 => 32,
        }
    }

    pub fn hasher(&self) -> ContentHasher {
        match self {
            Self::Sha256 => ContentHasher::Sha256(Sha256::new()),
            Self::Md5 => ContentHasher::Md5(md5::Context::new()),
        }
    }

    pub fn all() -> [DigestAlgorithm; 2] {
        [Self::Sha256, Self::Md5]
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DigestAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(Self::Sha256),
            "md5" => Ok(Self::Md5),
            other => Err(format!("unsupported digest algorithm `{}`", other)),
        }
    }
}

/// Incremental hasher fed chunk by chunk while a payload streams to disk.
pub enum ContentHasher {
    Sha256(Sha256),
    Md5(md5::Context),
}

impl ContentHasher {
    pub fn update(&mut self, chunk: &[u8]) {
        match self {
            Self::Sha256(hasher) => hasher.update(chunk),
            Self::Md5(ctx) => ctx.consume(chunk),
        }
    }

    pub fn finalize(self) -> Digest {
        match self {
            Self::Sha256(hasher) => Digest(format!("sha256:{:x}", hasher.finalize())),
            Self::Md5(ctx) => Digest(format!("md5:{:x}", ctx.compute())),
        }
    }
}

/// A validated content address.
///
/// Deserialized values and catalog reads are checked with [`Digest::parse`],
/// so `hex()` always has the algorithm's length and is lowercase hex.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Digest of an in-memory payload.
    pub fn compute(algorithm: DigestAlgorithm, data: &[u8]) -> Self {
        let mut hasher = algorithm.hasher();
        hasher.update(data);
        hasher.finalize()
    }

    /// Parse `{algorithm}:{hex}`, rejecting anything that could not have
    /// come out of [`ContentHasher::finalize`].
    pub fn parse(value: &str) -> Option<Self> {
        let (algo, hex) = value.split_once(':')?;
        let algorithm = algo.parse::<DigestAlgorithm>().ok()?;
        if algorithm.as_str() != algo || hex.len() != algorithm.hex_len() {
            return None;
        }
        if !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return None;
        }
        Some(Self(value.to_string()))
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        match self.0.split_once(':') {
            Some(("md5", _)) => DigestAlgorithm::Md5,
            _ => DigestAlgorithm::Sha256,
        }
    }

    pub fn hex(&self) -> &str {
        self.0.split_once(':').map(|(_, hex)| hex).unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Digest {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Digest::parse(&value).ok_or_else(|| format!("invalid digest `{}`", value))
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.0
    }
}

impl Type<Sqlite> for Digest {
    fn type_info() -> SqliteTypeInfo {
        <String as Type<Sqlite>>::type_info()
    }

    fn compatible(ty: &SqliteTypeInfo) -> bool {
        <String as Type<Sqlite>>::compatible(ty)
    }
}

impl<'q> Encode<'q, Sqlite> for Digest {
    fn encode_by_ref(
        &self,
        buf: &mut <Sqlite as Database>::ArgumentBuffer<'q>,
    ) -> Result<IsNull, BoxDynError> {
        <String as Encode<'q, Sqlite>>::encode_by_ref(&self.0, buf)
    }
}

impl<'r> Decode<'r, Sqlite> for Digest {
    fn decode(value: <Sqlite as Database>::ValueRef<'r>) -> Result<Self, BoxDynError> {
        let raw = <String as Decode<'r, Sqlite>>::decode(value)?;
        Ok(Digest::try_from(raw)?)
    }
}
