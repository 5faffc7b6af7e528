//! Binary snapshot persistence for the vector index.
//!
//! File format: snapshot.bin
//!
//! Header (47 bytes):
//! - version: u8 (1)
//! - model_id: [u8; 32] (SHA256 hash of the embedding model name)
//! - dimensions: u16 (little-endian)
//! - entry_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Entries (repeated, in insertion order):
//! - id_len: u8, id: UTF-8 ULID bytes
//! - seq: u64 (little-endian)
//! - text_len: u32 (little-endian), text: UTF-8 bytes
//! - vector: [f32; dimensions] (little-endian)

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::eid::Eid;
use crate::index::Entry;

/// Current file format version
const FORMAT_VERSION: u8 = 1;

/// Header size in bytes: version(1) + model_id(32) + dimensions(2) + entry_count(8) + checksum(4)
const HEADER_SIZE: usize = 47;

/// A serialized point-in-time copy of the full index.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub dimensions: usize,
    pub entries: Vec<Entry>,
}

/// Errors that can occur during snapshot persistence.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid snapshot format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Model mismatch: snapshot was written by a different embedding model")]
    ModelMismatch,

    #[error("Checksum mismatch: snapshot may be corrupted")]
    ChecksumMismatch,
}

/// Durable storage for index snapshots, written wholesale on every save.
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a snapshot exists at this location.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load and validate a snapshot.
    ///
    /// Structural violations (bad checksum, truncated file, invalid UTF-8)
    /// are errors; the caller decides whether they are fatal.
    pub fn load(&self, expected_model_id: &[u8; 32]) -> Result<Snapshot, SnapshotError> {
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);

        let header = read_header(&mut reader)?;
        if header.model_id != *expected_model_id {
            return Err(SnapshotError::ModelMismatch);
        }

        let dimensions = header.dimensions as usize;
        let mut entries = Vec::with_capacity(header.entry_count as usize);
        for _ in 0..header.entry_count {
            entries.push(read_entry(&mut reader, dimensions)?);
        }

        Ok(Snapshot {
            dimensions,
            entries,
        })
    }

    /// Save a snapshot atomically: temp file -> fsync -> rename.
    pub fn save(&self, snapshot: &Snapshot, model_id: &[u8; 32]) -> Result<(), SnapshotError> {
        let temp_path = self.path.with_extension("tmp");

        let result = write_to_file(&temp_path, snapshot, model_id);
        if result.is_err() {
            let _ = std::fs::remove_file(&temp_path);
            return result;
        }

        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

struct Header {
    model_id: [u8; 32],
    dimensions: u16,
    entry_count: u64,
}

fn write_to_file(
    path: &Path,
    snapshot: &Snapshot,
    model_id: &[u8; 32],
) -> Result<(), SnapshotError> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    let dimensions = u16::try_from(snapshot.dimensions)
        .map_err(|_| SnapshotError::InvalidFormat("dimensions exceed u16".to_string()))?;

    write_header(
        &mut writer,
        &Header {
            model_id: *model_id,
            dimensions,
            entry_count: snapshot.entries.len() as u64,
        },
    )?;

    for entry in &snapshot.entries {
        write_entry(&mut writer, entry)?;
    }

    writer.flush()?;
    let file = writer
        .into_inner()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    file.sync_all()?;

    Ok(())
}

fn write_header(writer: &mut impl Write, header: &Header) -> Result<(), SnapshotError> {
    let mut header_bytes = [0u8; HEADER_SIZE];

    header_bytes[0] = FORMAT_VERSION;
    header_bytes[1..33].copy_from_slice(&header.model_id);
    header_bytes[33..35].copy_from_slice(&header.dimensions.to_le_bytes());
    header_bytes[35..43].copy_from_slice(&header.entry_count.to_le_bytes());

    let checksum = crc32fast::hash(&header_bytes[0..43]);
    header_bytes[43..47].copy_from_slice(&checksum.to_le_bytes());

    writer.write_all(&header_bytes)?;
    Ok(())
}

fn read_header(reader: &mut impl Read) -> Result<Header, SnapshotError> {
    let mut header_bytes = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_bytes)?;

    let version = header_bytes[0];
    if version != FORMAT_VERSION {
        return Err(SnapshotError::VersionMismatch(version, FORMAT_VERSION));
    }

    let stored_checksum = u32::from_le_bytes(
        header_bytes[43..47]
            .try_into()
            .expect("slice of fixed length"),
    );
    let computed_checksum = crc32fast::hash(&header_bytes[0..43]);
    if stored_checksum != computed_checksum {
        return Err(SnapshotError::ChecksumMismatch);
    }

    let mut model_id = [0u8; 32];
    model_id.copy_from_slice(&header_bytes[1..33]);

    let dimensions = u16::from_le_bytes(
        header_bytes[33..35]
            .try_into()
            .expect("slice of fixed length"),
    );
    let entry_count = u64::from_le_bytes(
        header_bytes[35..43]
            .try_into()
            .expect("slice of fixed length"),
    );

    Ok(Header {
        model_id,
        dimensions,
        entry_count,
    })
}

fn write_entry(writer: &mut impl Write, entry: &Entry) -> Result<(), SnapshotError> {
    let id_bytes = entry.id.as_bytes();
    let id_len = u8::try_from(id_bytes.len())
        .map_err(|_| SnapshotError::InvalidFormat("entry id exceeds 255 bytes".to_string()))?;
    writer.write_all(&[id_len])?;
    writer.write_all(id_bytes)?;

    writer.write_all(&entry.seq.to_le_bytes())?;

    let text_bytes = entry.text.as_bytes();
    let text_len = u32::try_from(text_bytes.len())
        .map_err(|_| SnapshotError::InvalidFormat("entry text exceeds u32 length".to_string()))?;
    writer.write_all(&text_len.to_le_bytes())?;
    writer.write_all(text_bytes)?;

    for &value in &entry.vector {
        writer.write_all(&value.to_le_bytes())?;
    }

    Ok(())
}

fn read_entry(reader: &mut impl Read, dimensions: usize) -> Result<Entry, SnapshotError> {
    let mut id_len = [0u8; 1];
    reader.read_exact(&mut id_len)?;
    let mut id_bytes = vec![0u8; id_len[0] as usize];
    reader.read_exact(&mut id_bytes)?;
    let id = String::from_utf8(id_bytes)
        .map_err(|_| SnapshotError::InvalidFormat("entry id is not valid UTF-8".to_string()))?;

    let mut seq_bytes = [0u8; 8];
    reader.read_exact(&mut seq_bytes)?;
    let seq = u64::from_le_bytes(seq_bytes);

    let mut text_len_bytes = [0u8; 4];
    reader.read_exact(&mut text_len_bytes)?;
    let text_len = u32::from_le_bytes(text_len_bytes);
    let mut text_bytes = vec![0u8; text_len as usize];
    reader.read_exact(&mut text_bytes)?;
    let text = String::from_utf8(text_bytes)
        .map_err(|_| SnapshotError::InvalidFormat("entry text is not valid UTF-8".to_string()))?;

    let mut vector = Vec::with_capacity(dimensions);
    for _ in 0..dimensions {
        let mut float_bytes = [0u8; 4];
        reader.read_exact(&mut float_bytes)?;
        vector.push(f32::from_le_bytes(float_bytes));
    }

    Ok(Entry {
        id: Eid::from_str(&id).expect("infallible"),
        seq,
        vector,
        text,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::VectorIndex;

    fn test_model_id() -> [u8; 32] {
        let mut id = [0u8; 32];
        id[0] = 0xAB;
        id[31] = 0xCD;
        id
    }

    fn store(dir: &tempfile::TempDir) -> SnapshotStore {
        SnapshotStore::new(dir.path().join("snapshot.bin"))
    }

    #[test]
    fn test_save_and_load_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let model_id = test_model_id();

        store.save(&VectorIndex::new(384).export(), &model_id).unwrap();
        assert!(store.exists());

        let loaded = store.load(&model_id).unwrap();
        assert_eq!(loaded.entries.len(), 0);
        assert_eq!(loaded.dimensions, 384);
    }

    #[test]
    fn test_round_trip_preserves_order_and_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let model_id = test_model_id();

        let mut index = VectorIndex::new(3);
        index.insert(vec![1.0, 0.0, 0.0], "first".into()).unwrap();
        index.insert(vec![0.0, 1.0, 0.0], "second".into()).unwrap();
        index.insert(vec![0.0, 0.0, 1.0], "third".into()).unwrap();

        store.save(&index.export(), &model_id).unwrap();
        let loaded = store.load(&model_id).unwrap();

        assert_eq!(loaded.entries.len(), 3);
        let texts: Vec<_> = loaded.entries.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["first", "second", "third"]);
        assert_eq!(loaded.entries[0].vector, vec![1.0, 0.0, 0.0]);
        assert_eq!(loaded.entries[0].seq, 0);
        assert_eq!(loaded.entries[2].seq, 2);

        let original_ids: Vec<_> = index.iter().map(|e| e.id.clone()).collect();
        let loaded_ids: Vec<_> = loaded.entries.iter().map(|e| e.id.clone()).collect();
        assert_eq!(original_ids, loaded_ids);
    }

    #[test]
    fn test_model_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        store
            .save(&VectorIndex::new(3).export(), &test_model_id())
            .unwrap();

        let mut wrong_model_id = [0u8; 32];
        wrong_model_id[0] = 0xFF;
        let result = store.load(&wrong_model_id);
        assert!(matches!(result, Err(SnapshotError::ModelMismatch)));
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let model_id = test_model_id();

        let mut index = VectorIndex::new(3);
        index.insert(vec![1.0, 0.0, 0.0], "a".into()).unwrap();
        store.save(&index.export(), &model_id).unwrap();

        // flip a byte inside the header
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(store.path())
            .unwrap();
        use std::io::Seek;
        file.seek(std::io::SeekFrom::Start(10)).unwrap();
        file.write_all(&[0xFF]).unwrap();

        let result = store.load(&model_id);
        assert!(matches!(result, Err(SnapshotError::ChecksumMismatch)));
    }

    #[test]
    fn test_truncated_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let model_id = test_model_id();

        let mut index = VectorIndex::new(3);
        index.insert(vec![1.0, 0.0, 0.0], "a".into()).unwrap();
        index.insert(vec![0.0, 1.0, 0.0], "b".into()).unwrap();
        store.save(&index.export(), &model_id).unwrap();

        let bytes = std::fs::read(store.path()).unwrap();
        std::fs::write(store.path(), &bytes[..bytes.len() - 7]).unwrap();

        let result = store.load(&model_id);
        assert!(matches!(result, Err(SnapshotError::Io(_))));
    }

    #[test]
    fn test_unsupported_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let model_id = test_model_id();

        store.save(&VectorIndex::new(3).export(), &model_id).unwrap();

        // bump the version byte and fix up the checksum
        let mut bytes = std::fs::read(store.path()).unwrap();
        bytes[0] = FORMAT_VERSION + 1;
        let checksum = crc32fast::hash(&bytes[0..43]);
        bytes[43..47].copy_from_slice(&checksum.to_le_bytes());
        std::fs::write(store.path(), &bytes).unwrap();

        let result = store.load(&model_id);
        assert!(matches!(result, Err(SnapshotError::VersionMismatch(_, 1))));
    }

    #[test]
    fn test_atomic_write_cleans_up_on_error() {
        let path = PathBuf::from("/nonexistent/directory/snapshot.bin");
        let store = SnapshotStore::new(path.clone());

        let result = store.save(&VectorIndex::new(3).export(), &test_model_id());
        assert!(result.is_err());
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_save_overwrites_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let model_id = test_model_id();

        let mut index = VectorIndex::new(2);
        index.insert(vec![1.0, 0.0], "a".into()).unwrap();
        store.save(&index.export(), &model_id).unwrap();

        index.insert(vec![0.0, 1.0], "b".into()).unwrap();
        store.save(&index.export(), &model_id).unwrap();

        let loaded = store.load(&model_id).unwrap();
        assert_eq!(loaded.entries.len(), 2);
    }
}
