//! Visual vocabulary for place recognition.
//!
//! The vocabulary tree structure and quantization are handled by an external
//! component; the system only needs to load the trained vocabulary blob at
//! startup and hand it to that component. A missing or unreadable vocabulary
//! is a deployment defect, which callers escalate as fatal.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// An opaque, loaded vocabulary blob.
pub struct Vocabulary {
    path: PathBuf,
    bytes: Vec<u8>,
}

impl Vocabulary {
    /// Load a vocabulary file into memory.
    ///
    /// Fails on a missing or empty file; content is not interpreted here.
    pub fn load(path: &Path) -> io::Result<Self> {
        let bytes = fs::read(path)?;
        if bytes.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("vocabulary file is empty: {}", path.display()),
            ));
        }
        Ok(Self {
            path: path.to_path_buf(),
            bytes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size_bytes(&self) -> usize {
        self.bytes.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_missing_file_fails() {
        assert!(Vocabulary::load(Path::new("/nonexistent/vocab.bin")).is_err());
    }

    #[test]
    fn test_load_reads_bytes() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("vocab.bin");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&[1, 2, 3, 4]).unwrap();

        let vocab = Vocabulary::load(&path).unwrap();
        assert_eq!(vocab.size_bytes(), 4);
        assert_eq!(vocab.bytes(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_load_empty_file_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("vocab.bin");
        std::fs::File::create(&path).unwrap();
        assert!(Vocabulary::load(&path).is_err());
    }
}
