use crate::postings::{IterStrategy, PostingsIter, WordPostings};
use crate::store::IndexStore;
use crate::weights::{QueryVector, WeightModel};
use crate::{DocId, Entry, Error, Posting, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// How a posting contributes to a document's score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scoring {
    /// Cosine similarity of idf-weighted term frequency vectors.
    #[default]
    Tfidf,
    /// Like `Tfidf` but a document's term frequency is replaced by its square
    /// root, damping words that burst within one image.
    Burstiness,
}

impl Scoring {
    /// True when scoring rewrites posting weights per query, so postings-derived
    /// intermediate results must not be cached.
    pub fn changes_entry_weights(self) -> bool {
        match self {
            Scoring::Tfidf => false,
            Scoring::Burstiness => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    pub doc_id: DocId,
    pub score: f64,
}

/// Descending by score, ties ascending by doc id.
pub type QueryResult = Vec<Hit>;

#[derive(Debug, Clone, Copy)]
pub enum Query<'a> {
    /// Raw visual words of a query image; weighted before scoring.
    Bag(&'a [Entry]),
    Vector(&'a QueryVector),
}

#[derive(Default)]
pub struct RetrieverBuilder {
    store: Option<Arc<IndexStore>>,
    weights: Option<Arc<WeightModel>>,
    scoring: Scoring,
    strategy: IterStrategy,
}

impl RetrieverBuilder {
    pub fn store(mut self, store: Arc<IndexStore>) -> Self { self.store = Some(store); self }
    pub fn weights(mut self, weights: Arc<WeightModel>) -> Self { self.weights = Some(weights); self }
    pub fn scoring(mut self, scoring: Scoring) -> Self { self.scoring = scoring; self }
    pub fn strategy(mut self, strategy: IterStrategy) -> Self { self.strategy = strategy; self }

    pub fn build(self) -> Result<Retriever> {
        let store = self.store.ok_or(Error::MissingDependency("index store"))?;
        let weights = self.weights.ok_or(Error::MissingDependency("weight model"))?;
        weights.check_against(&store)?;
        Ok(Retriever { store, weights, scoring: self.scoring, strategy: self.strategy })
    }
}

/// Scores a query against the corpus. Cheap to share: all state is read-only
/// and every execution owns its own accumulator.
pub struct Retriever {
    store: Arc<IndexStore>,
    weights: Arc<WeightModel>,
    scoring: Scoring,
    strategy: IterStrategy,
}

impl Retriever {
    pub fn builder() -> RetrieverBuilder { RetrieverBuilder::default() }

    /// Ranked hits for `query`; `to_return == 0` returns every hit.
    pub fn execute(&self, query: Query<'_>, to_return: usize) -> Result<QueryResult> {
        let weighted;
        let query = match query {
            Query::Bag(bag) => {
                weighted = self.weights.weight_query(bag);
                &weighted
            }
            Query::Vector(qv) => qv,
        };
        let mut iter = self.strategy.postings_for(query, &self.store)?;
        self.execute_with(query, iter.as_mut(), to_return)
    }

    /// Score using a caller-supplied traversal over `query`'s postings.
    pub fn execute_with(&self, query: &QueryVector, iter: &mut dyn PostingsIter, to_return: usize) -> Result<QueryResult> {
        let start = Instant::now();
        if query.is_empty() || query.norm() == 0.0 {
            return Ok(Vec::new());
        }
        let mut scores: HashMap<DocId, f64> = HashMap::new();
        let mut words = 0usize;
        for item in iter {
            let WordPostings { word, query_weight, postings } = item?;
            words += 1;
            let idf = self.weights.idf(word);
            if idf == 0.0 { continue; }
            match self.scoring {
                Scoring::Tfidf => {
                    for p in postings.iter() {
                        *scores.entry(p.doc_id).or_insert(0.0) += query_weight * (p.tf as f64 * idf);
                    }
                }
                Scoring::Burstiness => {
                    for (doc_id, tf) in DocRuns::new(&postings) {
                        *scores.entry(doc_id).or_insert(0.0) += query_weight * ((tf as f64).sqrt() * idf);
                    }
                }
            }
        }
        let candidates = scores.len();
        let hits = self.rank(scores, query.norm(), to_return);
        tracing::debug!(words, candidates, hits = hits.len(), elapsed_ms = start.elapsed().as_secs_f64() * 1000.0, "query executed");
        Ok(hits)
    }

    /// Query with the visual words of an indexed document.
    pub fn query_doc(&self, doc_id: DocId, to_return: usize) -> Result<QueryResult> {
        let doc = self.store.entry(doc_id)?;
        self.execute(Query::Bag(&doc.entries), to_return)
    }

    fn rank(&self, scores: HashMap<DocId, f64>, q_norm: f64, to_return: usize) -> QueryResult {
        let mut hits: Vec<Hit> = scores
            .into_iter()
            .filter_map(|(doc_id, score)| {
                let d_norm = self.weights.doc_norm(doc_id);
                if score == 0.0 || d_norm == 0.0 { return None; }
                Some(Hit { doc_id, score: score / (q_norm * d_norm) })
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.doc_id.cmp(&b.doc_id)));
        if to_return > 0 { hits.truncate(to_return); }
        hits
    }

    pub fn num_docs(&self) -> u32 { self.store.num_docs() }
    pub fn changes_entry_weights(&self) -> bool { self.scoring.changes_entry_weights() }
    pub fn scoring(&self) -> Scoring { self.scoring }
    pub fn strategy(&self) -> IterStrategy { self.strategy }
    pub fn store(&self) -> &Arc<IndexStore> { &self.store }
    pub fn weights(&self) -> &Arc<WeightModel> { &self.weights }
}

/// Summed term frequency per run of equal doc ids in an ascending postings list.
struct DocRuns<'a> {
    postings: &'a [Posting],
    pos: usize,
}

impl<'a> DocRuns<'a> {
    fn new(postings: &'a [Posting]) -> Self { Self { postings, pos: 0 } }
}

impl Iterator for DocRuns<'_> {
    type Item = (DocId, u64);

    fn next(&mut self) -> Option<Self::Item> {
        let doc_id = self.postings.get(self.pos)?.doc_id;
        let mut tf = 0u64;
        while let Some(p) = self.postings.get(self.pos).filter(|p| p.doc_id == doc_id) {
            tf += p.tf as u64;
            self.pos += 1;
        }
        Some((doc_id, tf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(doc_id: DocId, tf: u32) -> Posting { Posting { doc_id, tf, spatial: None } }

    #[test]
    fn doc_runs_merge_adjacent_occurrences() {
        let postings = vec![p(0, 1), p(0, 2), p(3, 1), p(5, 1), p(5, 1)];
        let runs: Vec<_> = DocRuns::new(&postings).collect();
        assert_eq!(runs, vec![(0, 3), (3, 1), (5, 2)]);
    }

    #[test]
    fn only_burstiness_changes_entry_weights() {
        assert!(!Scoring::Tfidf.changes_entry_weights());
        assert!(Scoring::Burstiness.changes_entry_weights());
    }

    #[test]
    fn builder_requires_collaborators() {
        assert!(matches!(Retriever::builder().build(), Err(Error::MissingDependency("index store"))));
    }
}
