use crate::persist::{DbHandles, RecordDb};
use crate::{DocId, Document, Entry, Error, Posting, PostingsList, Result, WordId};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Where loaded records live. Query results are identical either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Residency {
    /// Decode every record at load time.
    #[default]
    InMemory,
    /// Keep the sled databases open and decode records per lookup.
    OnDemand,
}

enum Inverted {
    InMemory(Vec<PostingsList>),
    OnDemand(RecordDb),
}

enum Forward {
    InMemory(Vec<Arc<Document>>),
    OnDemand(RecordDb),
}

/// Read-only inverted (word -> postings) and forward (doc -> entries) index.
///
/// Immutable after `load`; share it behind an `Arc` across any number of queries.
pub struct IndexStore {
    iidx: Inverted,
    fidx: Forward,
    num_words: u32,
    num_docs: u32,
}

impl IndexStore {
    pub fn load(iidx_path: &Path, fidx_path: &Path, residency: Residency) -> Result<Self> {
        Self::load_with(iidx_path, fidx_path, residency, &DbHandles::new())
    }

    /// Like `load`, but shares databases already open in `handles`, so a store
    /// can be reloaded while an on-demand instance of it is still serving.
    pub fn load_with(iidx_path: &Path, fidx_path: &Path, residency: Residency, handles: &DbHandles) -> Result<Self> {
        let iidx_db = RecordDb::open_with(iidx_path, handles)?;
        let fidx_db = RecordDb::open_with(fidx_path, handles)?;
        let num_words = iidx_db.count;
        let num_docs = fidx_db.count;

        let fidx = match residency {
            Residency::InMemory => {
                let mut docs = Vec::with_capacity(num_docs as usize);
                for rec in fidx_db.scan::<Entry>() {
                    let (id, entries) = rec?;
                    if id as usize != docs.len() {
                        return Err(Error::CorruptIndex(format!("forward index not dense: expected doc {}, found {id}", docs.len())));
                    }
                    docs.push(Arc::new(Document { id, entries }));
                }
                if docs.len() != num_docs as usize {
                    return Err(Error::CorruptIndex(format!("forward index holds {} of {num_docs} docs", docs.len())));
                }
                Forward::InMemory(docs)
            }
            Residency::OnDemand => {
                if fidx_db.tree.len() != num_docs as usize {
                    return Err(Error::CorruptIndex(format!("forward index holds {} of {num_docs} docs", fidx_db.tree.len())));
                }
                Forward::OnDemand(fidx_db)
            }
        };

        let iidx = match residency {
            Residency::InMemory => {
                let empty: PostingsList = Arc::from(Vec::new());
                let mut lists = vec![empty; num_words as usize];
                for rec in iidx_db.scan::<Posting>() {
                    let (word, postings) = rec?;
                    check_postings(word, &postings, num_docs)?;
                    lists[word as usize] = Arc::from(postings);
                }
                Inverted::InMemory(lists)
            }
            Residency::OnDemand => Inverted::OnDemand(iidx_db),
        };

        tracing::info!(num_words, num_docs, ?residency, "index store loaded");
        Ok(Self { iidx, fidx, num_words, num_docs })
    }

    /// Postings of `word`, ascending by doc id. Unknown words yield an empty list.
    pub fn postings(&self, word: WordId) -> Result<PostingsList> {
        if word >= self.num_words {
            return Ok(Arc::from(Vec::new()));
        }
        match &self.iidx {
            Inverted::InMemory(lists) => Ok(lists[word as usize].clone()),
            Inverted::OnDemand(db) => {
                let postings = db.get::<Posting>(word)?.unwrap_or_default();
                check_postings(word, &postings, self.num_docs)?;
                Ok(Arc::from(postings))
            }
        }
    }

    pub fn entry(&self, doc_id: DocId) -> Result<Arc<Document>> {
        if doc_id >= self.num_docs {
            return Err(Error::OutOfRange { doc_id, num_docs: self.num_docs });
        }
        match &self.fidx {
            Forward::InMemory(docs) => Ok(docs[doc_id as usize].clone()),
            Forward::OnDemand(db) => match db.get::<Entry>(doc_id)? {
                Some(entries) => Ok(Arc::new(Document { id: doc_id, entries })),
                None => Err(Error::NotFound(doc_id)),
            },
        }
    }

    pub fn num_docs(&self) -> u32 { self.num_docs }

    pub fn num_words(&self) -> u32 { self.num_words }
}

fn check_postings(word: WordId, postings: &[Posting], num_docs: u32) -> Result<()> {
    if postings.windows(2).any(|w| w[0].doc_id > w[1].doc_id) {
        return Err(Error::CorruptIndex(format!("postings of word {word} not ascending by doc id")));
    }
    if let Some(last) = postings.last() {
        if last.doc_id >= num_docs {
            return Err(Error::CorruptIndex(format!("word {word} posts doc {} >= {num_docs}", last.doc_id)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::write_records;

    fn p(doc_id: DocId, tf: u32) -> Posting { Posting { doc_id, tf, spatial: None } }

    fn write_fidx(path: &Path, docs: &[Vec<Entry>]) {
        write_records(path, docs.len() as u32, docs.iter().enumerate().map(|(i, d)| (i as u32, d.as_slice()))).unwrap();
    }

    #[test]
    fn unsorted_postings_are_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let (iidx, fidx) = (dir.path().join("iidx.sled"), dir.path().join("fidx.sled"));
        let bad = vec![p(1, 1), p(0, 1)];
        write_records(&iidx, 1, vec![(0, bad.as_slice())]).unwrap();
        write_fidx(&fidx, &[vec![Entry::new(0, 1)], vec![Entry::new(0, 1)]]);

        assert!(matches!(IndexStore::load(&iidx, &fidx, Residency::InMemory), Err(Error::CorruptIndex(_))));
        let lazy = IndexStore::load(&iidx, &fidx, Residency::OnDemand).unwrap();
        assert!(matches!(lazy.postings(0), Err(Error::CorruptIndex(_))));
    }

    #[test]
    fn sparse_forward_index_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let (iidx, fidx) = (dir.path().join("iidx.sled"), dir.path().join("fidx.sled"));
        let none: Vec<Posting> = Vec::new();
        write_records(&iidx, 1, vec![(0, none.as_slice())]).unwrap();
        let doc = vec![Entry::new(0, 1)];
        write_records(&fidx, 3, vec![(0, doc.as_slice()), (2, doc.as_slice())]).unwrap();

        for residency in [Residency::InMemory, Residency::OnDemand] {
            assert!(matches!(IndexStore::load(&iidx, &fidx, residency), Err(Error::CorruptIndex(_))));
        }
    }

    #[test]
    fn unknown_word_is_empty_and_bad_doc_is_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let (iidx, fidx) = (dir.path().join("iidx.sled"), dir.path().join("fidx.sled"));
        let list = vec![p(0, 3)];
        write_records(&iidx, 2, vec![(1, list.as_slice())]).unwrap();
        write_fidx(&fidx, &[vec![Entry::new(1, 3)]]);

        for residency in [Residency::InMemory, Residency::OnDemand] {
            let store = IndexStore::load(&iidx, &fidx, residency).unwrap();
            assert!(store.postings(0).unwrap().is_empty());
            assert!(store.postings(99).unwrap().is_empty());
            assert_eq!(&*store.postings(1).unwrap(), list.as_slice());
            assert_eq!(store.entry(0).unwrap().entries, vec![Entry::new(1, 3)]);
            assert!(matches!(store.entry(1), Err(Error::OutOfRange { doc_id: 1, num_docs: 1 })));
        }
    }
}
