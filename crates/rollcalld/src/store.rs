//! Durable identity store with an in-memory matching snapshot.
//!
//! SQLite holds the identities and their embeddings; the matcher reads an
//! `Arc<Gallery>` snapshot. Writers are serialized by an async mutex and
//! publish a fresh snapshot only after their transaction commits, so readers
//! never observe a half-written identity.

use crate::db::{decode_vector, encode_vector, now_rfc3339, StoreError};
use rollcall_core::{Embedding, Gallery, Identity};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};
use tokio_rusqlite::Connection;

/// Identity metadata without embedding payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentitySummary {
    pub id: String,
    pub display_name: String,
    pub samples: usize,
    pub synthetic: bool,
    pub enrolled_at: String,
}

pub struct IdentityStore {
    conn: Connection,
    dim: usize,
    snapshot: RwLock<Arc<Gallery>>,
    writer: tokio::sync::Mutex<()>,
}

impl IdentityStore {
    /// Load every stored identity into the initial snapshot.
    pub async fn open(conn: Connection, dim: usize) -> Result<Self, StoreError> {
        let identities = conn
            .call(|c| Ok(load_all(c)?))
            .await
            .map_err(StoreError::Read)?;
        let gallery = Gallery::from_identities(dim, &identities)?;

        tracing::info!(
            identities = gallery.len(),
            embeddings = gallery.rows(),
            dim,
            "identity store loaded"
        );

        Ok(Self {
            conn,
            dim,
            snapshot: RwLock::new(Arc::new(gallery)),
            writer: tokio::sync::Mutex::new(()),
        })
    }

    /// Point-in-time view of every enrolled embedding.
    pub fn snapshot(&self) -> Arc<Gallery> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn publish(&self, gallery: Gallery) {
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(gallery);
    }

    /// Number of enrolled identities, synthetic included.
    pub fn count(&self) -> usize {
        self.snapshot().len()
    }

    pub fn count_synthetic(&self) -> usize {
        self.snapshot().entries().iter().filter(|e| e.synthetic).count()
    }

    /// Add an identity, replacing any existing identity with the same id.
    pub async fn insert(&self, mut identity: Identity) -> Result<(), StoreError> {
        identity.check_dim(self.dim)?;
        if identity.embeddings.is_empty() {
            return Err(StoreError::NoEmbeddings(identity.id));
        }
        if identity.enrolled_at.is_empty() {
            identity.enrolled_at = now_rfc3339();
        }

        let _guard = self.writer.lock().await;

        let row = identity.clone();
        self.conn
            .call(move |c| {
                let tx = c.transaction()?;
                tx.execute("DELETE FROM identities WHERE id = ?1", params![row.id])?;
                insert_identity(&tx, &row)?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(StoreError::Write)?;

        let next = self.snapshot().upsert(&identity)?;
        self.publish(next);

        tracing::info!(
            id = %identity.id,
            name = %identity.display_name,
            samples = identity.embeddings.len(),
            "identity stored"
        );
        Ok(())
    }

    /// Append one enrollment sample to an existing identity. Returns the new sample count.
    pub async fn add_sample(&self, id: &str, embedding: Embedding) -> Result<usize, StoreError> {
        if embedding.dim() != self.dim {
            return Err(rollcall_core::DimensionMismatch {
                expected: self.dim,
                actual: embedding.dim(),
            }
            .into());
        }

        let _guard = self.writer.lock().await;

        let key = id.to_string();
        let updated = self
            .conn
            .call(move |c| {
                let tx = c.transaction()?;
                let exists: Option<i64> = tx
                    .query_row("SELECT 1 FROM identities WHERE id = ?1", params![key], |r| r.get(0))
                    .optional()?;
                if exists.is_none() {
                    return Ok(None);
                }
                insert_embedding(&tx, &key, &embedding, &now_rfc3339())?;
                tx.commit()?;
                Ok(load_one(c, &key)?)
            })
            .await
            .map_err(StoreError::Write)?;

        let identity = updated.ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let samples = identity.embeddings.len();
        let next = self.snapshot().upsert(&identity)?;
        self.publish(next);

        tracing::info!(id, samples, "enrollment sample added");
        Ok(samples)
    }

    /// Remove an identity and its embeddings. Attendance history is untouched.
    pub async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let _guard = self.writer.lock().await;

        let key = id.to_string();
        let removed = self
            .conn
            .call(move |c| Ok(c.execute("DELETE FROM identities WHERE id = ?1", params![key])?))
            .await
            .map_err(StoreError::Write)?;

        if removed > 0 {
            let next = self.snapshot().retain(|e| e.identity.id != id);
            self.publish(next);
            tracing::info!(id, "identity removed");
        }
        Ok(removed > 0)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Identity>, StoreError> {
        let key = id.to_string();
        self.conn
            .call(move |c| Ok(load_one(c, &key)?))
            .await
            .map_err(StoreError::Read)
    }

    pub async fn list(&self, include_synthetic: bool) -> Result<Vec<IdentitySummary>, StoreError> {
        self.conn
            .call(move |c| {
                let mut stmt = c.prepare(
                    "SELECT i.id, i.display_name, i.synthetic, i.enrolled_at, COUNT(e.row_id)
                     FROM identities i LEFT JOIN embeddings e ON e.identity_id = i.id
                     WHERE ?1 OR i.synthetic = 0
                     GROUP BY i.id
                     ORDER BY i.enrolled_at, i.id",
                )?;
                let rows = stmt
                    .query_map(params![include_synthetic], |r| {
                        Ok(IdentitySummary {
                            id: r.get(0)?,
                            display_name: r.get(1)?,
                            synthetic: r.get(2)?,
                            enrolled_at: r.get(3)?,
                            samples: r.get::<_, i64>(4)? as usize,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(StoreError::Read)
    }

    /// Bulk-insert `count` random identities marked synthetic, in one transaction.
    pub async fn generate_synthetic(&self, count: usize) -> Result<usize, StoreError> {
        let identities: Vec<Identity> = {
            let mut rng = rand::thread_rng();
            let enrolled_at = now_rfc3339();
            (0..count)
                .map(|i| Identity {
                    id: format!("synthetic-{}", uuid::Uuid::new_v4()),
                    display_name: format!("Synthetic {i:05}"),
                    embeddings: vec![Embedding::random_unit(&mut rng, self.dim)],
                    enrolled_at: enrolled_at.clone(),
                    synthetic: true,
                })
                .collect()
        };

        let _guard = self.writer.lock().await;

        let identities = self
            .conn
            .call(move |c| {
                let tx = c.transaction()?;
                for identity in &identities {
                    insert_identity(&tx, identity)?;
                }
                tx.commit()?;
                Ok(identities)
            })
            .await
            .map_err(StoreError::Write)?;

        let next = self.snapshot().extended(&identities)?;
        let total = next.len();
        self.publish(next);

        tracing::info!(generated = count, total, "synthetic identities generated");
        Ok(count)
    }

    /// Delete every synthetic identity, leaving genuine enrollments intact.
    pub async fn clear_synthetic(&self) -> Result<usize, StoreError> {
        let _guard = self.writer.lock().await;

        let removed = self
            .conn
            .call(|c| Ok(c.execute("DELETE FROM identities WHERE synthetic = 1", [])?))
            .await
            .map_err(StoreError::Write)?;

        let next = self.snapshot().retain(|e| !e.synthetic);
        let total = next.len();
        self.publish(next);

        tracing::info!(removed, total, "synthetic identities cleared");
        Ok(removed)
    }
}

fn insert_identity(tx: &rusqlite::Transaction<'_>, identity: &Identity) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO identities (id, display_name, synthetic, enrolled_at) VALUES (?1, ?2, ?3, ?4)",
        params![
            identity.id,
            identity.display_name,
            identity.synthetic,
            identity.enrolled_at
        ],
    )?;
    for embedding in &identity.embeddings {
        insert_embedding(tx, &identity.id, embedding, &identity.enrolled_at)?;
    }
    Ok(())
}

fn insert_embedding(
    tx: &rusqlite::Transaction<'_>,
    identity_id: &str,
    embedding: &Embedding,
    created_at: &str,
) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO embeddings (identity_id, dim, vector, model_version, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            identity_id,
            embedding.dim() as i64,
            encode_vector(&embedding.values),
            embedding.model_version,
            created_at
        ],
    )?;
    Ok(())
}

fn blob_to_embedding(blob: Vec<u8>, model_version: Option<String>) -> rusqlite::Result<Embedding> {
    let values = decode_vector(&blob).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Blob,
            format!("embedding blob of {} bytes is not a whole number of f32", blob.len()).into(),
        )
    })?;
    Ok(Embedding {
        values,
        model_version,
    })
}

/// Every identity with its embeddings, in enrollment order.
fn load_all(c: &rusqlite::Connection) -> rusqlite::Result<Vec<Identity>> {
    let mut stmt = c.prepare(
        "SELECT i.id, i.display_name, i.synthetic, i.enrolled_at, e.vector, e.model_version
         FROM identities i JOIN embeddings e ON e.identity_id = i.id
         ORDER BY i.enrolled_at, i.id, e.row_id",
    )?;
    let mut rows = stmt.query([])?;

    let mut identities: Vec<Identity> = Vec::new();
    while let Some(row) = rows.next()? {
        let id: String = row.get(0)?;
        let embedding = blob_to_embedding(row.get(4)?, row.get(5)?)?;
        match identities.last_mut() {
            Some(current) if current.id == id => current.embeddings.push(embedding),
            _ => identities.push(Identity {
                id,
                display_name: row.get(1)?,
                synthetic: row.get(2)?,
                enrolled_at: row.get(3)?,
                embeddings: vec![embedding],
            }),
        }
    }
    Ok(identities)
}

fn load_one(c: &rusqlite::Connection, id: &str) -> rusqlite::Result<Option<Identity>> {
    let header = c
        .query_row(
            "SELECT id, display_name, synthetic, enrolled_at FROM identities WHERE id = ?1",
            params![id],
            |r| {
                Ok(Identity {
                    id: r.get(0)?,
                    display_name: r.get(1)?,
                    synthetic: r.get(2)?,
                    enrolled_at: r.get(3)?,
                    embeddings: Vec::new(),
                })
            },
        )
        .optional()?;
    let Some(mut identity) = header else {
        return Ok(None);
    };

    let mut stmt = c.prepare(
        "SELECT vector, model_version FROM embeddings WHERE identity_id = ?1 ORDER BY row_id",
    )?;
    let mut rows = stmt.query(params![id])?;
    while let Some(row) = rows.next()? {
        identity.embeddings.push(blob_to_embedding(row.get(0)?, row.get(1)?)?);
    }
    Ok(Some(identity))
}
