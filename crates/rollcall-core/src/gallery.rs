//! Gallery store contract and the validated in-memory snapshot the
//! matcher runs against.

use crate::types::{Embedding, GalleryEntry, IdentityId, ScopeId};
use std::collections::{BTreeSet, HashMap};
use std::convert::Infallible;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("gallery entry {index} (identity {identity}) has dimension {actual}, expected {expected}")]
    InconsistentDimension {
        index: usize,
        identity: IdentityId,
        expected: usize,
        actual: usize,
    },
    #[error("gallery entry {index} (identity {identity}) has a non-finite component")]
    NonFinite { index: usize, identity: IdentityId },
    #[error("malformed embedding text: {0}")]
    Malformed(String),
    #[error("gallery store: {0}")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Read access to enrolled embeddings.
///
/// Entries come back in a stable order (enrollment order); the matcher
/// breaks ties by that order.
pub trait GalleryStore {
    type Error: std::error::Error + Send + Sync + 'static;

    fn load_gallery(&self, scope: ScopeId) -> Result<Vec<GalleryEntry>, Self::Error>;
}

/// Immutable gallery snapshot whose entries all share one dimensionality.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
    dimension: Option<usize>,
}

impl Gallery {
    pub fn new(entries: Vec<GalleryEntry>) -> Result<Self, GalleryError> {
        let dimension = entries.first().map(|e| e.embedding.dimension());
        if let Some(expected) = dimension {
            if let Some((index, entry)) = entries
                .iter()
                .enumerate()
                .find(|(_, e)| e.embedding.dimension() != expected)
            {
                return Err(GalleryError::InconsistentDimension {
                    index,
                    identity: entry.identity,
                    expected,
                    actual: entry.embedding.dimension(),
                });
            }
        }
        if let Some((index, entry)) = entries
            .iter()
            .enumerate()
            .find(|(_, e)| e.embedding.values.iter().any(|v| !v.is_finite()))
        {
            return Err(GalleryError::NonFinite {
                index,
                identity: entry.identity,
            });
        }
        Ok(Self { entries, dimension })
    }

    /// Fetch a scope from the store and validate it.
    pub fn load<S: GalleryStore>(store: &S, scope: ScopeId) -> Result<Self, GalleryError> {
        let entries = store
            .load_gallery(scope)
            .map_err(|e| GalleryError::Store(Box::new(e)))?;
        let gallery = Self::new(entries)?;
        tracing::debug!(
            %scope,
            entries = gallery.len(),
            identities = gallery.identities().len(),
            dimension = ?gallery.dimension,
            "gallery loaded"
        );
        Ok(gallery)
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    /// Shared dimensionality, `None` for an empty gallery.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn identities(&self) -> BTreeSet<IdentityId> {
        self.entries.iter().map(|e| e.identity).collect()
    }
}

impl AsRef<[GalleryEntry]> for Gallery {
    fn as_ref(&self) -> &[GalleryEntry] {
        &self.entries
    }
}

/// Parse the legacy textual form of an embedding: a JSON array of floats.
pub fn parse_embedding_text(text: &str) -> Result<Embedding, GalleryError> {
    let values: Vec<f32> =
        serde_json::from_str(text).map_err(|e| GalleryError::Malformed(e.to_string()))?;
    if values.is_empty() {
        return Err(GalleryError::Malformed("empty embedding".into()));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(GalleryError::Malformed("non-finite component".into()));
    }
    Ok(Embedding::new(values))
}

/// `GalleryStore` held entirely in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryGallery {
    scopes: HashMap<ScopeId, Vec<GalleryEntry>>,
}

impl InMemoryGallery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, scope: ScopeId, entry: GalleryEntry) {
        self.scopes.entry(scope).or_default().push(entry);
    }
}

impl GalleryStore for InMemoryGallery {
    type Error = Infallible;

    fn load_gallery(&self, scope: ScopeId) -> Result<Vec<GalleryEntry>, Infallible> {
        Ok(self.scopes.get(&scope).cloned().unwrap_or_default())
    }
}
