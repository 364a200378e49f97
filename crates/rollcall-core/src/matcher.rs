//! 1:N identity matching over an in-memory gallery.
//!
//! The [`Gallery`] keeps every stored embedding in one flat row-major buffer,
//! L2-normalized on insertion, with a row range per identity. Matching is a
//! dot product per row and an identity scores the max over its rows.

use crate::types::{
    l2_normalize, DimensionMismatch, Embedding, Identity, IdentityRef, MatchDecision, MatchResult,
};
use std::ops::Range;
use thiserror::Error;

/// Best and runner-up identities closer than this are ambiguous.
pub const DEFAULT_TIE_EPSILON: f32 = 1e-4;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error(transparent)]
    DimensionMismatch(#[from] DimensionMismatch),
}

#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub identity: IdentityRef,
    pub synthetic: bool,
    rows: Range<usize>,
}

impl GalleryEntry {
    pub fn samples(&self) -> usize {
        self.rows.len()
    }
}

/// Immutable-by-convention snapshot of every enrolled embedding.
///
/// Mutating helpers return a new gallery; the store publishes it whole.
#[derive(Debug, Clone)]
pub struct Gallery {
    dim: usize,
    data: Vec<f32>,
    entries: Vec<GalleryEntry>,
}

impl Gallery {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            data: Vec::new(),
            entries: Vec::new(),
        }
    }

    pub fn from_identities<'a, I>(dim: usize, identities: I) -> Result<Self, DimensionMismatch>
    where
        I: IntoIterator<Item = &'a Identity>,
    {
        let mut gallery = Self::new(dim);
        for identity in identities {
            gallery.push(identity)?;
        }
        Ok(gallery)
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of identities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of stored embeddings across all identities.
    pub fn rows(&self) -> usize {
        if self.dim == 0 {
            0
        } else {
            self.data.len() / self.dim
        }
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.iter().any(|e| e.identity.id == id)
    }

    fn row(&self, index: usize) -> &[f32] {
        &self.data[index * self.dim..(index + 1) * self.dim]
    }

    /// Append an identity. Identities without embeddings are skipped.
    pub fn push(&mut self, identity: &Identity) -> Result<(), DimensionMismatch> {
        identity.check_dim(self.dim)?;
        if identity.embeddings.is_empty() {
            return Ok(());
        }

        let start = self.rows();
        for embedding in &identity.embeddings {
            let offset = self.data.len();
            self.data.extend_from_slice(&embedding.values);
            l2_normalize(&mut self.data[offset..]);
        }
        self.entries.push(GalleryEntry {
            identity: identity.to_ref(),
            synthetic: identity.synthetic,
            rows: start..self.rows(),
        });
        Ok(())
    }

    /// Copy of this gallery keeping only entries for which `keep` holds.
    pub fn retain<F>(&self, mut keep: F) -> Self
    where
        F: FnMut(&GalleryEntry) -> bool,
    {
        let mut next = Self::new(self.dim);
        for entry in self.entries.iter().filter(|&e| keep(e)) {
            let start = next.rows();
            for row in entry.rows.clone() {
                next.data.extend_from_slice(self.row(row));
            }
            next.entries.push(GalleryEntry {
                identity: entry.identity.clone(),
                synthetic: entry.synthetic,
                rows: start..next.rows(),
            });
        }
        next
    }

    /// Copy with `identity` replacing any entry of the same id.
    pub fn upsert(&self, identity: &Identity) -> Result<Self, DimensionMismatch> {
        identity.check_dim(self.dim)?;
        let mut next = self.retain(|e| e.identity.id != identity.id);
        next.push(identity)?;
        Ok(next)
    }

    /// Copy with every identity in `identities` appended.
    pub fn extended<'a, I>(&self, identities: I) -> Result<Self, DimensionMismatch>
    where
        I: IntoIterator<Item = &'a Identity>,
    {
        let mut next = self.clone();
        for identity in identities {
            next.push(identity)?;
        }
        Ok(next)
    }
}

/// Trait for matching a query embedding against a gallery.
pub trait Matcher: Send + Sync {
    fn compare(
        &self,
        query: &Embedding,
        gallery: &Gallery,
        threshold: f32,
    ) -> Result<MatchResult, MatchError>;
}

/// Cosine similarity matcher with a full gallery traversal.
///
/// Every row is scored on every request; there is no early exit, so latency
/// depends only on gallery size.
#[derive(Debug, Clone, Copy)]
pub struct CosineMatcher {
    pub tie_epsilon: f32,
}

impl Default for CosineMatcher {
    fn default() -> Self {
        Self {
            tie_epsilon: DEFAULT_TIE_EPSILON,
        }
    }
}

impl CosineMatcher {
    pub fn new(tie_epsilon: f32) -> Self {
        Self { tie_epsilon }
    }
}

impl Matcher for CosineMatcher {
    fn compare(
        &self,
        query: &Embedding,
        gallery: &Gallery,
        threshold: f32,
    ) -> Result<MatchResult, MatchError> {
        if query.dim() != gallery.dim() {
            return Err(DimensionMismatch {
                expected: gallery.dim(),
                actual: query.dim(),
            }
            .into());
        }

        let mut unit = query.values.clone();
        l2_normalize(&mut unit);

        let mut best_sim = f32::NEG_INFINITY;
        let mut best_idx: Option<usize> = None;
        let mut second_sim = f32::NEG_INFINITY;
        let mut compared = 0usize;

        for (idx, entry) in gallery.entries.iter().enumerate() {
            let mut score = f32::NEG_INFINITY;
            for row in entry.rows.clone() {
                let sim = dot(&unit, gallery.row(row));
                if sim > score {
                    score = sim;
                }
                compared += 1;
            }

            if score > best_sim {
                second_sim = best_sim;
                best_sim = score;
                best_idx = Some(idx);
            } else if score > second_sim {
                second_sim = score;
            }
        }

        let runner_up = (second_sim > f32::NEG_INFINITY).then_some(second_sim);

        let result = match best_idx {
            Some(idx) if best_sim >= threshold => {
                let tied = runner_up.is_some_and(|r| best_sim - r <= self.tie_epsilon);
                MatchResult {
                    decision: if tied {
                        MatchDecision::AmbiguousMatch
                    } else {
                        MatchDecision::Accept
                    },
                    similarity: best_sim,
                    identity: (!tied).then(|| gallery.entries[idx].identity.clone()),
                    runner_up,
                    compared,
                }
            }
            _ => MatchResult {
                decision: MatchDecision::NoMatch,
                similarity: if best_sim == f32::NEG_INFINITY { 0.0 } else { best_sim },
                identity: None,
                runner_up,
                compared,
            },
        };
        Ok(result)
    }
}

#[inline]
fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
