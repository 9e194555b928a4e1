//! Streaming SHA-256 content checksums used as the whole-file dedup key.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;

const BUFFER_SIZE: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum ChecksumError {
    #[error("Failed to read '{path}' for checksum: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Hashes everything `reader` yields. Returns 64 lowercase hex characters.
pub fn checksum_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hashes a file without loading it into memory.
pub fn checksum_file(path: &Path) -> Result<String, ChecksumError> {
    let read_err = |source| ChecksumError::Read {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(read_err)?;
    checksum_reader(io::BufReader::new(file)).map_err(read_err)
}

/// Hashes an in-memory string.
pub fn sha256_hex(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}
