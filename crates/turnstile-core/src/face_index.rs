//! Face index: embedding id → vector + owner metadata, queried by
//! nearest-neighbour similarity.
//!
//! The [`FaceIndex`] trait is the seam to whatever similarity service backs a
//! deployment. [`SqliteFaceIndex`] is the bundled implementation: a separate
//! SQLite file holding little-endian f32 blobs, searched exhaustively by
//! cosine similarity. Galleries for a door kiosk are small enough that a
//! linear scan is fine.

use crate::types::{Embedding, FaceEmbeddingRecord, FaceMatch, FaceOwner};
use rusqlite::{params, Connection};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS face_index (
    embedding_id TEXT PRIMARY KEY,
    user_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    card_uid TEXT NOT NULL,
    image_path TEXT NOT NULL,
    enrolled_at TEXT NOT NULL,
    dimension INTEGER NOT NULL,
    vector BLOB NOT NULL
);
";

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("embedding id already indexed: {0}")]
    DuplicateId(String),
    #[error("invalid vector: {0}")]
    InvalidVector(String),
    #[error("corrupt index row {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

/// Similarity search over enrolled face embeddings.
pub trait FaceIndex {
    /// Add a record. Ids are unique; re-adding an id is an error.
    fn add(&self, record: &FaceEmbeddingRecord) -> Result<(), IndexError>;

    /// Up to `k` nearest records to `probe`, most similar first.
    fn search(&self, probe: &Embedding, k: usize) -> Result<Vec<FaceMatch>, IndexError>;

    fn contains(&self, embedding_id: &str) -> Result<bool, IndexError>;

    fn ids(&self) -> Result<HashSet<String>, IndexError>;

    fn len(&self) -> Result<usize, IndexError>;

    fn is_empty(&self) -> Result<bool, IndexError> {
        Ok(self.len()? == 0)
    }
}

/// SQLite-backed [`FaceIndex`].
pub struct SqliteFaceIndex {
    conn: Connection,
}

impl SqliteFaceIndex {
    /// Open or create the index at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, IndexError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, IndexError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, IndexError> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn })
    }
}

impl FaceIndex for SqliteFaceIndex {
    fn add(&self, record: &FaceEmbeddingRecord) -> Result<(), IndexError> {
        validate_vector(&record.embedding.values)?;
        let dimension = i64::try_from(record.embedding.dim())
            .map_err(|_| IndexError::InvalidVector("dimension overflow".into()))?;

        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO face_index (
                embedding_id, user_id, name, card_uid, image_path, enrolled_at, dimension, vector
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.embedding_id,
                record.owner.user_id,
                record.owner.name,
                record.owner.card_uid,
                record.source_image_path.to_string_lossy(),
                record.enrolled_at,
                dimension,
                encode_vector(&record.embedding.values),
            ],
        )?;
        if inserted == 0 {
            return Err(IndexError::DuplicateId(record.embedding_id.clone()));
        }

        tracing::debug!(
            embedding_id = %record.embedding_id,
            user_id = record.owner.user_id,
            "face index record added"
        );
        Ok(())
    }

    fn search(&self, probe: &Embedding, k: usize) -> Result<Vec<FaceMatch>, IndexError> {
        if k == 0 || probe.values.is_empty() {
            return Ok(Vec::new());
        }
        validate_vector(&probe.values)?;

        let dimension = i64::try_from(probe.dim())
            .map_err(|_| IndexError::InvalidVector("dimension overflow".into()))?;
        let mut stmt = self.conn.prepare(
            "SELECT embedding_id, user_id, name, card_uid, image_path, vector
             FROM face_index
             WHERE dimension = ?1
             ORDER BY embedding_id ASC",
        )?;
        let rows = stmt.query_map(params![dimension], |row| {
            let image_path: String = row.get(4)?;
            let blob: Vec<u8> = row.get(5)?;
            Ok((
                row.get::<_, String>(0)?,
                FaceOwner {
                    user_id: row.get(1)?,
                    name: row.get(2)?,
                    card_uid: row.get(3)?,
                },
                PathBuf::from(image_path),
                blob,
            ))
        })?;

        // Every candidate is scored; no early exit on a good-enough hit.
        let mut hits = Vec::new();
        for row in rows {
            let (embedding_id, owner, source_image_path, blob) = row?;
            let values = decode_vector(&blob, probe.dim()).map_err(|reason| IndexError::Corrupt {
                id: embedding_id.clone(),
                reason,
            })?;
            let similarity = probe.similarity(&Embedding::new(values));
            hits.push(FaceMatch {
                embedding_id,
                owner,
                source_image_path,
                similarity,
            });
        }

        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.embedding_id.cmp(&b.embedding_id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    fn contains(&self, embedding_id: &str) -> Result<bool, IndexError> {
        let found: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM face_index WHERE embedding_id = ?1)",
            params![embedding_id],
            |row| row.get(0),
        )?;
        Ok(found)
    }

    fn ids(&self) -> Result<HashSet<String>, IndexError> {
        let mut stmt = self.conn.prepare("SELECT embedding_id FROM face_index")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn len(&self) -> Result<usize, IndexError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM face_index", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}

fn validate_vector(values: &[f32]) -> Result<(), IndexError> {
    if values.is_empty() {
        return Err(IndexError::InvalidVector("vector is empty".into()));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(IndexError::InvalidVector(
            "vector contains non-finite values".into(),
        ));
    }
    Ok(())
}

fn encode_vector(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(std::mem::size_of_val(values));
    for value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_vector(blob: &[u8], dimension: usize) -> Result<Vec<f32>, String> {
    let expected = dimension * std::mem::size_of::<f32>();
    if blob.len() != expected {
        return Err(format!(
            "invalid vector byte length: expected {expected}, got {}",
            blob.len()
        ));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}
