use crate::store::IndexStore;
use crate::weights::QueryVector;
use crate::{PostingsList, Result, WordId};
use serde::{Deserialize, Serialize};

/// Postings of one distinct query word together with its query weight.
#[derive(Debug, Clone)]
pub struct WordPostings {
    pub word: WordId,
    pub query_weight: f64,
    pub postings: PostingsList,
}

/// Traversal over the distinct words of a query, ascending by word id.
///
/// Implementations differ only in when postings are fetched; for the same
/// query and store they yield the same items in the same order.
pub trait PostingsIter: Iterator<Item = Result<WordPostings>> {
    /// Items not yet yielded.
    fn remaining(&self) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterStrategy {
    /// Fetch each word's postings when it is reached.
    #[default]
    Online,
    /// Fetch all postings before the first item.
    Precomputed,
}

impl IterStrategy {
    pub fn postings_for<'a>(self, query: &'a QueryVector, store: &'a IndexStore) -> Result<Box<dyn PostingsIter + 'a>> {
        Ok(match self {
            IterStrategy::Online => Box::new(OnlinePostings::new(query, store)),
            IterStrategy::Precomputed => Box::new(PrecomputedPostings::resolve(query, store)?),
        })
    }
}

pub struct OnlinePostings<'a> {
    words: &'a [(WordId, f64)],
    pos: usize,
    store: &'a IndexStore,
}

impl<'a> OnlinePostings<'a> {
    pub fn new(query: &'a QueryVector, store: &'a IndexStore) -> Self {
        Self { words: query.weights(), pos: 0, store }
    }
}

impl Iterator for OnlinePostings<'_> {
    type Item = Result<WordPostings>;

    fn next(&mut self) -> Option<Self::Item> {
        let &(word, query_weight) = self.words.get(self.pos)?;
        self.pos += 1;
        Some(self.store.postings(word).map(|postings| WordPostings { word, query_weight, postings }))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining();
        (n, Some(n))
    }
}

impl PostingsIter for OnlinePostings<'_> {
    fn remaining(&self) -> usize { self.words.len() - self.pos }
}

/// Materialized postings of a query; `rewind` replays them for another pass.
#[derive(Debug, Clone)]
pub struct PrecomputedPostings {
    items: Vec<WordPostings>,
    pos: usize,
}

impl PrecomputedPostings {
    pub fn resolve(query: &QueryVector, store: &IndexStore) -> Result<Self> {
        let items = OnlinePostings::new(query, store).collect::<Result<Vec<_>>>()?;
        Ok(Self { items, pos: 0 })
    }

    pub fn rewind(&mut self) { self.pos = 0; }

    pub fn total_postings(&self) -> usize { self.items.iter().map(|i| i.postings.len()).sum() }
}

impl Iterator for PrecomputedPostings {
    type Item = Result<WordPostings>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.items.get(self.pos)?.clone();
        self.pos += 1;
        Some(Ok(item))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining();
        (n, Some(n))
    }
}

impl PostingsIter for PrecomputedPostings {
    fn remaining(&self) -> usize { self.items.len() - self.pos }
}
