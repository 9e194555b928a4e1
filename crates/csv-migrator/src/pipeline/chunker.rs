//! Streaming CSV row counting and chunking.
//!
//! Both passes use the same reader settings so the row count always agrees
//! with the chunk boundaries. Blank lines are skipped by the reader.

use std::fs::File;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::filter::Record;

use super::error::ProcessError;

/// Ordered, fixed-size slice of a file's rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub index: u64,
    /// Number of data rows this chunk covers.
    pub row_count: u64,
    /// Empty when the chunk was read hollow because it was already applied.
    pub records: Vec<Record>,
    pub hollow: bool,
}

/// Number of chunks needed for `total_rows`.
pub fn chunk_count(total_rows: u64, chunk_size: usize) -> u64 {
    let size = chunk_size.max(1) as u64;
    total_rows.div_ceil(size)
}

fn open_reader(path: &Path) -> Result<csv::Reader<File>, ProcessError> {
    let file = File::open(path).map_err(|source| ProcessError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(file))
}

/// Counts data rows (the header is excluded). Blocking.
pub fn count_rows(path: &Path) -> Result<u64, ProcessError> {
    let mut reader = open_reader(path)?;
    let mut record = csv::ByteRecord::new();
    let mut rows = 0u64;
    while reader
        .read_byte_record(&mut record)
        .map_err(|source| ProcessError::Csv {
            path: path.to_path_buf(),
            source,
        })?
    {
        rows += 1;
    }
    Ok(rows)
}

/// Reads a CSV file chunk by chunk. Blocking; drive it from `spawn_blocking`.
pub struct ChunkReader {
    path: PathBuf,
    reader: csv::Reader<File>,
    headers: Vec<String>,
    chunk_size: usize,
    next_index: u64,
    exhausted: bool,
}

impl ChunkReader {
    pub fn open(path: &Path, chunk_size: usize) -> Result<Self, ProcessError> {
        let mut reader = open_reader(path)?;
        let headers = reader
            .headers()
            .map_err(|source| ProcessError::Csv {
                path: path.to_path_buf(),
                source,
            })?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();

        Ok(Self {
            path: path.to_path_buf(),
            reader,
            headers,
            chunk_size: chunk_size.max(1),
            next_index: 0,
            exhausted: false,
        })
    }

    /// Reads the next chunk. With `hollow`, rows are counted but not decoded.
    pub fn next_chunk(&mut self, hollow: bool) -> Result<Option<Chunk>, ProcessError> {
        if self.exhausted {
            return Ok(None);
        }

        let mut records = Vec::new();
        let mut row_count = 0u64;
        let mut row = csv::StringRecord::new();
        let mut raw = csv::ByteRecord::new();

        while row_count < self.chunk_size as u64 {
            let read = if hollow {
                self.reader.read_byte_record(&mut raw)
            } else {
                self.reader.read_record(&mut row)
            };
            let more = read.map_err(|source| ProcessError::Csv {
                path: self.path.clone(),
                source,
            })?;

            if !more {
                self.exhausted = true;
                break;
            }
            row_count += 1;
            if !hollow {
                records.push(self.to_record(&row));
            }
        }

        if row_count == 0 {
            return Ok(None);
        }

        let chunk = Chunk {
            index: self.next_index,
            row_count,
            records,
            hollow,
        };
        self.next_index += 1;
        Ok(Some(chunk))
    }

    /// Reads up to `width` chunks. `skip` decides which are read hollow.
    pub fn next_wave<F>(&mut self, width: usize, skip: F) -> Result<Vec<Chunk>, ProcessError>
    where
        F: Fn(u64) -> bool,
    {
        let mut wave = Vec::with_capacity(width);
        while wave.len() < width.max(1) {
            let hollow = skip(self.next_index);
            match self.next_chunk(hollow)? {
                Some(chunk) => wave.push(chunk),
                None => break,
            }
        }
        Ok(wave)
    }

    fn to_record(&self, row: &csv::StringRecord) -> Record {
        self.headers
            .iter()
            .zip(row.iter())
            .map(|(header, cell)| (header.clone(), Value::String(cell.to_string())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_csv(dir: &TempDir, rows: usize) -> PathBuf {
        let path = dir.path().join("data.csv");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "id,name").unwrap();
        for i in 0..rows {
            writeln!(file, "{},person-{}", i, i).unwrap();
        }
        path
    }

    #[test]
    fn test_chunk_count() {
        assert_eq!(chunk_count(0, 1000), 0);
        assert_eq!(chunk_count(1, 1000), 1);
        assert_eq!(chunk_count(1000, 1000), 1);
        assert_eq!(chunk_count(2500, 1000), 3);
        assert_eq!(chunk_count(5, 0), 5);
    }

    #[test]
    fn test_count_rows_excludes_header_and_blank_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blank.csv");
        std::fs::write(&path, "id,name\n1,a\n\n2,b\n").unwrap();
        assert_eq!(count_rows(&path).unwrap(), 2);
    }

    #[test]
    fn test_chunks_are_positional() {
        let dir = TempDir::new().unwrap();
        let path = write_csv(&dir, 2500);
        let mut reader = ChunkReader::open(&path, 1000).unwrap();

        let sizes: Vec<(u64, u64)> = std::iter::from_fn(|| reader.next_chunk(false).unwrap())
            .map(|c| (c.index, c.row_count))
            .collect();
        assert_eq!(sizes, vec![(0, 1000), (1, 1000), (2, 500)]);
    }

    #[test]
    fn test_records_keyed_by_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short.csv");
        std::fs::write(&path, "id, name ,extra\n1,Ada\n2,Bob,x,ignored\n").unwrap();

        let mut reader = ChunkReader::open(&path, 10).unwrap();
        let chunk = reader.next_chunk(false).unwrap().unwrap();
        assert_eq!(chunk.records.len(), 2);
        assert_eq!(chunk.records[0]["name"], "Ada");
        assert!(!chunk.records[0].contains_key("extra"));
        assert_eq!(chunk.records[1]["extra"], "x");
        assert_eq!(chunk.records[1].len(), 3);
    }

    #[test]
    fn test_wave_reads_skipped_chunks_hollow() {
        let dir = TempDir::new().unwrap();
        let path = write_csv(&dir, 25);
        let mut reader = ChunkReader::open(&path, 10).unwrap();

        let wave = reader.next_wave(2, |i| i == 0).unwrap();
        assert_eq!(wave.len(), 2);
        assert!(wave[0].hollow);
        assert!(wave[0].records.is_empty());
        assert_eq!(wave[0].row_count, 10);
        assert_eq!(wave[1].records[0]["id"], "10");

        let rest = reader.next_wave(2, |_| false).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].index, 2);
        assert!(reader.next_wave(2, |_| false).unwrap().is_empty());
    }

    #[test]
    fn test_header_only_file() {
        let dir = TempDir::new().unwrap();
        let path = write_csv(&dir, 0);
        assert_eq!(count_rows(&path).unwrap(), 0);
        let mut reader = ChunkReader::open(&path, 10).unwrap();
        assert!(reader.next_chunk(false).unwrap().is_none());
    }
}
