//! Bag-of-visual-words image retrieval: inverted and forward index storage,
//! tf-idf weights, postings traversal and query scoring.

pub mod build;
pub mod engine;
pub mod error;
pub mod index;
pub mod persist;
pub mod postings;
pub mod progress;
pub mod retriever;
pub mod store;
pub mod weights;

pub use error::{Error, Result};
pub use index::*;
pub use postings::{IterStrategy, OnlinePostings, PostingsIter, PrecomputedPostings, WordPostings};
pub use retriever::{Hit, Query, QueryResult, Retriever, RetrieverBuilder, Scoring};
pub use store::{IndexStore, Residency};
pub use weights::{QueryVector, WeightModel};

use std::path::Path;

/// Open the inverted and forward record databases.
pub fn load_index(iidx: &Path, fidx: &Path, residency: Residency) -> Result<IndexStore> {
    IndexStore::load(iidx, fidx, residency)
}

pub fn load_weights(path: &Path) -> Result<WeightModel> {
    WeightModel::load(path)
}
