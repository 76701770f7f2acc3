use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub type WordId = u32;
pub type DocId = u32;

/// Affine-covariant region of a local feature. Carried through the index untouched.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Spatial {
    pub x: f32,
    pub y: f32,
    pub scale: f32,
    pub orientation: f32,
    /// Ellipse shape `[a, b, c]` of `a*x^2 + 2*b*x*y + c*y^2 = 1`.
    pub ellipse: Option<[f32; 3]>,
}

/// One visual word occurrence inside a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub word: WordId,
    pub tf: u32,
    pub spatial: Option<Spatial>,
}

impl Entry {
    pub fn new(word: WordId, tf: u32) -> Self { Self { word, tf, spatial: None } }
    pub fn with_spatial(mut self, spatial: Spatial) -> Self { self.spatial = Some(spatial); self }
}

/// Forward index record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocId,
    pub entries: Vec<Entry>,
}

/// Inverted index record item; one per occurrence, so a doc may repeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Posting {
    pub doc_id: DocId,
    pub tf: u32,
    pub spatial: Option<Spatial>,
}

/// Postings sorted ascending by doc_id.
pub type PostingsList = Arc<[Posting]>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocMeta {
    /// Image file name relative to the engine's image directory.
    pub name: String,
}
