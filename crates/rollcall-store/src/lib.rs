//! rollcall-store — SQLite-backed gallery of enrolled face embeddings.
//!
//! Embeddings are stored as little-endian `f32` BLOBs next to their
//! dimension, so a truncated or foreign vector is caught when the gallery
//! is loaded rather than during matching.

use chrono::{DateTime, Utc};
use rollcall_core::{Embedding, GalleryEntry, GalleryStore, IdentityId, Pose, ScopeId};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS embeddings (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    scope_id      INTEGER NOT NULL,
    identity_id   INTEGER NOT NULL,
    pose          TEXT    NOT NULL,
    dimension     INTEGER NOT NULL,
    vector        BLOB    NOT NULL,
    model_version TEXT,
    created_at    TEXT    NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_embeddings_scope ON embeddings(scope_id);
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt row {id}: {reason}")]
    Corrupt { id: i64, reason: String },
    #[error("row {id}: {source}")]
    InvalidPose {
        id: i64,
        #[source]
        source: rollcall_core::types::UnknownPose,
    },
    #[error("scope {scope} stores {expected}-dim embeddings, refusing {actual}-dim")]
    DimensionMismatch {
        scope: ScopeId,
        expected: usize,
        actual: usize,
    },
    #[error("refusing to store an empty embedding")]
    EmptyEmbedding,
    #[error("refusing to store an embedding with a non-finite component at index {index}")]
    NonFiniteEmbedding { index: usize },
}

/// Enrollment metadata, without the vector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrollmentRecord {
    pub id: i64,
    pub scope: ScopeId,
    pub identity: IdentityId,
    pub pose: Pose,
    pub dimension: usize,
    pub model_version: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub fn encode_vector(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn decode_vector(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

pub struct SqliteGallery {
    conn: Connection,
}

impl SqliteGallery {
    /// Open (or create) the database at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), "gallery database opened");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    fn scope_dimension(&self, scope: ScopeId) -> Result<Option<usize>, StoreError> {
        let row: Option<(i64, i64)> = self
            .conn
            .query_row(
                "SELECT id, dimension FROM embeddings WHERE scope_id = ?1 ORDER BY id LIMIT 1",
                params![scope.0],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        row.map(|(id, d)| stored_dimension(id, d)).transpose()
    }

    /// Store one pose sample for an identity. Returns the new row id.
    ///
    /// All embeddings in a scope must share one dimensionality.
    pub fn enroll(
        &self,
        scope: ScopeId,
        identity: IdentityId,
        pose: Pose,
        embedding: &Embedding,
    ) -> Result<i64, StoreError> {
        let actual = embedding.dimension();
        if actual == 0 {
            return Err(StoreError::EmptyEmbedding);
        }
        if let Some(index) = embedding.values.iter().position(|v| !v.is_finite()) {
            return Err(StoreError::NonFiniteEmbedding { index });
        }
        if let Some(expected) = self.scope_dimension(scope)? {
            if expected != actual {
                return Err(StoreError::DimensionMismatch {
                    scope,
                    expected,
                    actual,
                });
            }
        }

        self.conn.execute(
            "INSERT INTO embeddings (scope_id, identity_id, pose, dimension, vector, model_version, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                scope.0,
                identity.0,
                pose.as_str(),
                actual as i64,
                encode_vector(&embedding.values),
                embedding.model_version,
                Utc::now().to_rfc3339(),
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        tracing::info!(%scope, %identity, %pose, id, "embedding enrolled");
        Ok(id)
    }

    /// Enrollment metadata for a scope, in enrollment order.
    pub fn list(&self, scope: ScopeId) -> Result<Vec<EnrollmentRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, identity_id, pose, dimension, model_version, created_at
             FROM embeddings WHERE scope_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![scope.0], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, identity, pose, dimension, model_version, created_at) = row?;
            records.push(EnrollmentRecord {
                id,
                scope,
                identity: IdentityId(identity),
                pose: parse_pose(id, &pose)?,
                dimension: stored_dimension(id, dimension)?,
                model_version,
                created_at: DateTime::parse_from_rfc3339(&created_at)
                    .map_err(|e| StoreError::Corrupt {
                        id,
                        reason: format!("bad timestamp {created_at:?}: {e}"),
                    })?
                    .with_timezone(&Utc),
            });
        }
        Ok(records)
    }

    /// Delete every embedding of `identity` in `scope`. Returns rows removed.
    pub fn remove_identity(&self, scope: ScopeId, identity: IdentityId) -> Result<usize, StoreError> {
        let removed = self.conn.execute(
            "DELETE FROM embeddings WHERE scope_id = ?1 AND identity_id = ?2",
            params![scope.0, identity.0],
        )?;
        tracing::info!(%scope, %identity, removed, "identity removed");
        Ok(removed)
    }
}

fn stored_dimension(id: i64, dimension: i64) -> Result<usize, StoreError> {
    usize::try_from(dimension).map_err(|_| StoreError::Corrupt {
        id,
        reason: format!("invalid dimension {dimension}"),
    })
}

fn parse_pose(id: i64, label: &str) -> Result<Pose, StoreError> {
    label
        .parse()
        .map_err(|source| StoreError::InvalidPose { id, source })
}

impl GalleryStore for SqliteGallery {
    type Error = StoreError;

    fn load_gallery(&self, scope: ScopeId) -> Result<Vec<GalleryEntry>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, identity_id, pose, dimension, vector, model_version
             FROM embeddings WHERE scope_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![scope.0], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, Vec<u8>>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, identity, pose, dimension, blob, model_version) = row?;
            let values = decode_vector(&blob).ok_or_else(|| StoreError::Corrupt {
                id,
                reason: format!("vector blob length {} is not a multiple of 4", blob.len()),
            })?;
            if values.len() as i64 != dimension {
                return Err(StoreError::Corrupt {
                    id,
                    reason: format!("declared dimension {dimension}, blob holds {}", values.len()),
                });
            }
            entries.push(GalleryEntry {
                identity: IdentityId(identity),
                pose: parse_pose(id, &pose)?,
                embedding: Embedding {
                    values,
                    model_version,
                },
            });
        }

        tracing::debug!(%scope, entries = entries.len(), "gallery rows read");
        Ok(entries)
    }
}
