use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs::File;
use std::io::Read;
use std::path::Path;

const READ_BUFFER_SIZE: usize = 8192;

/// Lowercase hex digest of a file's bytes. Primary identity of a catalog entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Shortest hash that still yields both bucket directories and a file stem.
    pub const MIN_LEN: usize = 5;

    pub fn parse(value: &str) -> Result<Self, InvalidHash> {
        let valid = value.len() >= Self::MIN_LEN
            && value
                .bytes()
                .all(|byte| byte.is_ascii_digit() || (b'a'..=b'f').contains(&byte));
        if valid {
            Ok(Self(value.to_string()))
        } else {
            Err(InvalidHash(value.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits the hash into the two bucket directory names and the remainder.
    pub fn buckets(&self) -> (&str, &str, &str) {
        (&self.0[..2], &self.0[2..4], &self.0[4..])
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidHash(pub String);

impl Display for InvalidHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "not a content hash: {:?}", self.0)
    }
}

impl Error for InvalidHash {}

/// Streams `path` through SHA-256 with a fixed-size buffer.
pub fn hash_file(path: &Path) -> std::io::Result<ContentHash> {
    let mut file = File::open(path)?;
    hash_reader(&mut file)
}

pub fn hash_reader<R: Read>(reader: &mut R) -> std::io::Result<ContentHash> {
    let mut hasher = Sha256::new();
    let mut buffer = [0; READ_BUFFER_SIZE];

    loop {
        let count = reader.read(&mut buffer)?;
        if count == 0 {
            break;
        }
        hasher.update(&buffer[..count]);
    }

    Ok(ContentHash(format!("{:x}", hasher.finalize())))
}
