use crate::persist::{load_weights, WeightsFile};
use crate::store::IndexStore;
use crate::{DocId, Entry, Error, Result, WordId};
use std::collections::BTreeMap;
use std::path::Path;

/// Allowed idf drift between two independent computations of the same index.
pub const IDF_TOLERANCE: f64 = 1e-7;
/// Allowed doc norm drift; looser than idf since norms accumulate many terms.
pub const DOC_NORM_TOLERANCE: f64 = 1e-3;

/// Deduplicated idf-weighted query, ascending by word id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryVector {
    weights: Vec<(WordId, f64)>,
    norm: f64,
}

impl QueryVector {
    /// Build from already weighted pairs. Repeated words are summed and zero weights dropped.
    pub fn new<I: IntoIterator<Item = (WordId, f64)>>(weights: I) -> Self {
        let mut merged: BTreeMap<WordId, f64> = BTreeMap::new();
        for (word, w) in weights {
            *merged.entry(word).or_insert(0.0) += w;
        }
        let weights: Vec<(WordId, f64)> = merged.into_iter().filter(|(_, w)| *w != 0.0).collect();
        let norm = weights.iter().map(|(_, w)| w * w).sum::<f64>().sqrt();
        Self { weights, norm }
    }

    pub fn weights(&self) -> &[(WordId, f64)] { &self.weights }
    pub fn norm(&self) -> f64 { self.norm }
    pub fn is_empty(&self) -> bool { self.weights.is_empty() }
}

/// Per-word idf and per-document L2 norms, both derived from one idf table.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightModel {
    idf: Vec<f64>,
    doc_norm: Vec<f64>,
}

impl WeightModel {
    pub fn load(path: &Path) -> Result<Self> {
        let WeightsFile { idf, doc_norm } = load_weights(path)?;
        if let Some(i) = idf.iter().position(|v| !v.is_finite() || *v < 0.0) {
            return Err(Error::CorruptIndex(format!("idf[{i}] = {}", idf[i])));
        }
        if let Some(d) = doc_norm.iter().position(|v| !v.is_finite() || *v < 0.0) {
            return Err(Error::CorruptIndex(format!("doc_norm[{d}] = {}", doc_norm[d])));
        }
        tracing::debug!(num_words = idf.len(), num_docs = doc_norm.len(), "weights loaded");
        Ok(Self { idf, doc_norm })
    }

    /// Compute idf and doc norms from forward records, `docs[i]` being doc `i`.
    pub fn compute_from_docs<D: AsRef<[Entry]>>(num_words: u32, docs: &[D]) -> Self {
        let mut df = vec![0u32; num_words as usize];
        for doc in docs {
            for word in term_frequencies(doc.as_ref()).into_keys() {
                if let Some(slot) = df.get_mut(word as usize) { *slot += 1; }
            }
        }
        let n = docs.len() as f64;
        let idf: Vec<f64> = df.iter().map(|&d| if d == 0 { 0.0 } else { (n / d as f64).ln() }).collect();
        let doc_norm = docs.iter().map(|d| weighted_norm(d.as_ref(), &idf)).collect();
        Self { idf, doc_norm }
    }

    /// Recompute weights from the forward index of a loaded store.
    pub fn compute(store: &IndexStore) -> Result<Self> {
        let mut docs = Vec::with_capacity(store.num_docs() as usize);
        for doc_id in 0..store.num_docs() {
            docs.push(store.entry(doc_id)?);
        }
        let docs: Vec<&[Entry]> = docs.iter().map(|d| d.entries.as_slice()).collect();
        Ok(Self::compute_from_docs(store.num_words(), &docs))
    }

    /// Zero for words never seen in the corpus.
    pub fn idf(&self, word: WordId) -> f64 { self.idf.get(word as usize).copied().unwrap_or(0.0) }

    pub fn doc_norm(&self, doc_id: DocId) -> f64 { self.doc_norm.get(doc_id as usize).copied().unwrap_or(0.0) }

    pub fn num_words(&self) -> u32 { self.idf.len() as u32 }

    pub fn num_docs(&self) -> u32 { self.doc_norm.len() as u32 }

    pub fn weight_query(&self, bag: &[Entry]) -> QueryVector {
        QueryVector::new(term_frequencies(bag).into_iter().map(|(word, tf)| (word, tf as f64 * self.idf(word))))
    }

    /// Table sizes must match the store's vocabulary and corpus.
    pub fn check_against(&self, store: &IndexStore) -> Result<()> {
        if self.num_words() != store.num_words() {
            return Err(Error::InconsistentWeights(format!("{} idf values for {} words", self.num_words(), store.num_words())));
        }
        if self.num_docs() != store.num_docs() {
            return Err(Error::InconsistentWeights(format!("{} doc norms for {} docs", self.num_docs(), store.num_docs())));
        }
        Ok(())
    }

    /// Agreement within `IDF_TOLERANCE` / `DOC_NORM_TOLERANCE`; reports the first drift.
    pub fn compare(&self, other: &WeightModel) -> Result<()> {
        if self.idf.len() != other.idf.len() || self.doc_norm.len() != other.doc_norm.len() {
            return Err(Error::InconsistentWeights(format!(
                "table sizes differ: {}/{} vs {}/{}",
                self.idf.len(), self.doc_norm.len(), other.idf.len(), other.doc_norm.len()
            )));
        }
        for (word, (a, b)) in self.idf.iter().zip(&other.idf).enumerate() {
            if (a - b).abs() >= IDF_TOLERANCE {
                return Err(Error::InconsistentWeights(format!("idf of word {word}: {a} vs {b}")));
            }
        }
        for (doc, (a, b)) in self.doc_norm.iter().zip(&other.doc_norm).enumerate() {
            if (a - b).abs() >= DOC_NORM_TOLERANCE {
                return Err(Error::InconsistentWeights(format!("norm of doc {doc}: {a} vs {b}")));
            }
        }
        Ok(())
    }

    pub fn to_file(&self) -> WeightsFile {
        WeightsFile { idf: self.idf.clone(), doc_norm: self.doc_norm.clone() }
    }
}

/// Summed term frequency per distinct word.
pub fn term_frequencies(entries: &[Entry]) -> BTreeMap<WordId, u64> {
    let mut tf: BTreeMap<WordId, u64> = BTreeMap::new();
    for e in entries {
        *tf.entry(e.word).or_insert(0) += e.tf as u64;
    }
    tf
}

/// L2 norm of the idf-weighted term frequency vector of `entries`.
pub fn weighted_norm(entries: &[Entry], idf: &[f64]) -> f64 {
    term_frequencies(entries)
        .into_iter()
        .map(|(word, tf)| {
            let w = tf as f64 * idf.get(word as usize).copied().unwrap_or(0.0);
            w * w
        })
        .sum::<f64>()
        .sqrt()
}
