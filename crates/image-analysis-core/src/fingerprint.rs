/// Content identity of image files
use crate::error::Result;
use serde::{Deserialize, Serialize};

use std::{fmt, fs::File, io::Read, path::Path};

const CHUNK_SIZE: usize = 8192;

/// Content-derived key correlating an image to its stored analysis record.
///
/// Identical bytes always map to the same identity; any byte change maps to a
/// different one. The file name and location play no part.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageIdentity(String);

impl ImageIdentity {
    /// Wrap an already computed hex digest
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log lines
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for ImageIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compute the identity of a file by streaming it through Blake3
pub fn fingerprint<P: AsRef<Path>>(path: P) -> Result<ImageIdentity> {
    let hash = {
        let mut file = File::open(&path)?;
        let mut hasher = blake3::Hasher::new();

        let mut buffer = [0; CHUNK_SIZE];
        loop {
            let bytes_read = file.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }

        hasher.finalize()
    };

    Ok(ImageIdentity(hash.to_hex().to_string()))
}

/// Identity of bytes already held in memory; equal to [`fingerprint`] of a
/// file with the same contents
pub fn fingerprint_bytes(bytes: &[u8]) -> ImageIdentity {
    ImageIdentity(blake3::hash(bytes).to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use proptest::prelude::*;
    use tempfile::tempdir;

    fn write_bytes(dir: &Path, name: &str, bytes: &[u8]) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn test_known_digest() {
        let dir = tempdir().unwrap();
        let path = write_bytes(dir.path(), "empty.jpg", b"");

        // Blake3 of the empty input
        assert_eq!(
            fingerprint(&path).unwrap().as_str(),
            "af1349b9f5f9a1a6a0404dea36dcc9499bcb25c9adc112b7cc9a93cae41f3262"
        );
    }

    #[test]
    fn test_identity_ignores_name_and_location() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("nested");
        std::fs::create_dir(&sub).unwrap();

        let a = write_bytes(dir.path(), "a.jpg", b"same bytes");
        let b = write_bytes(&sub, "b.png", b"same bytes");

        assert_eq!(fingerprint(&a).unwrap(), fingerprint(&b).unwrap());
    }

    #[test]
    fn test_file_larger_than_one_chunk() {
        let dir = tempdir().unwrap();
        let mut bytes = vec![7u8; CHUNK_SIZE * 3 + 17];
        let path = write_bytes(dir.path(), "big.jpg", &bytes);
        let before = fingerprint(&path).unwrap();

        *bytes.last_mut().unwrap() = 8;
        std::fs::write(&path, &bytes).unwrap();
        assert_ne!(before, fingerprint(&path).unwrap());
    }

    #[test]
    fn test_in_memory_digest_matches_streamed_file() {
        let dir = tempdir().unwrap();
        let bytes: Vec<u8> = (0..CHUNK_SIZE * 2 + 5).map(|i| (i % 251) as u8).collect();
        let path = write_bytes(dir.path(), "pic.png", &bytes);

        assert_eq!(fingerprint_bytes(&bytes), fingerprint(&path).unwrap());
        assert_eq!(
            fingerprint_bytes(b"").as_str(),
            "af1349b9f5f9a1a6a0404dea36dcc9499bcb25c9adc112b7cc9a93cae41f3262"
        );
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = fingerprint("/path/that/does/not/exist.jpg");
        assert!(matches!(result, Err(Error::Io(_))));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_stable_and_sensitive_to_any_byte_flip(
            bytes in prop::collection::vec(any::<u8>(), 1..20_000),
            index in any::<prop::sample::Index>(),
            flip in 1u8..=255,
        ) {
            let dir = tempdir().unwrap();
            let path = write_bytes(dir.path(), "img.jpg", &bytes);

            let first = fingerprint(&path).unwrap();
            let second = fingerprint(&path).unwrap();
            prop_assert_eq!(&first, &second);

            let mut mutated = bytes.clone();
            let i = index.index(mutated.len());
            mutated[i] ^= flip;
            std::fs::write(&path, &mutated).unwrap();

            prop_assert_ne!(first, fingerprint(&path).unwrap());
        }
    }
}
