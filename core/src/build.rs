use crate::persist::{now_rfc3339, save_docs, save_meta, save_weights, write_records, IndexPaths, MetaFile, FORMAT_VERSION};
use crate::progress::{STAGE_INVERT, STAGE_WEIGHTS};
use crate::weights::WeightModel;
use crate::{DocId, DocMeta, Entry, Error, Posting, Result};

/// Largest vocabulary an index may have. `finish` allocates a postings list per word.
pub const MAX_VOCABULARY: u32 = 1 << 24;

/// Accumulates assigned documents and writes the inverted index, forward
/// index, weights, doc names and meta in one pass.
#[derive(Default)]
pub struct IndexBuilder {
    num_words: u32,
    docs: Vec<Vec<Entry>>,
    metas: Vec<DocMeta>,
}

impl IndexBuilder {
    pub fn new() -> Self { Self::default() }

    /// Vocabulary size of the clustering; grows if a document uses a larger word id.
    pub fn with_vocabulary(num_words: u32) -> Self { Self { num_words, ..Self::default() } }

    /// Fails without adding anything if a word id is beyond `MAX_VOCABULARY`.
    pub fn add_document(&mut self, name: impl Into<String>, entries: Vec<Entry>) -> Result<DocId> {
        let doc_id = self.docs.len() as DocId;
        if let Some(max) = entries.iter().map(|e| e.word).max() {
            let needed = max
                .checked_add(1)
                .filter(|&n| n <= MAX_VOCABULARY)
                .ok_or(Error::VocabularyOverflow { word: max, limit: MAX_VOCABULARY })?;
            self.num_words = self.num_words.max(needed);
        }
        self.docs.push(entries);
        self.metas.push(DocMeta { name: name.into() });
        Ok(doc_id)
    }

    pub fn num_docs(&self) -> u32 { self.docs.len() as u32 }

    pub fn num_words(&self) -> u32 { self.num_words }

    /// `progress(stage, done, count)` is called as each stage advances.
    pub fn finish(self, paths: &IndexPaths, progress: &mut dyn FnMut(&str, u64, u64)) -> Result<MetaFile> {
        let num_docs = self.num_docs();
        let num_words = self.num_words;
        if num_words > MAX_VOCABULARY {
            return Err(Error::VocabularyOverflow { word: num_words - 1, limit: MAX_VOCABULARY });
        }
        std::fs::create_dir_all(&paths.root)?;

        let step = (num_docs as u64 / 100).max(1);
        let mut postings: Vec<Vec<Posting>> = vec![Vec::new(); num_words as usize];
        for (doc_id, entries) in self.docs.iter().enumerate() {
            for e in entries {
                postings[e.word as usize].push(Posting { doc_id: doc_id as DocId, tf: e.tf, spatial: e.spatial });
            }
            let done = doc_id as u64 + 1;
            if done % step == 0 || done == num_docs as u64 {
                progress(STAGE_INVERT, done, num_docs as u64);
            }
        }
        write_records(
            &paths.iidx(),
            num_words,
            postings.iter().enumerate().filter(|(_, p)| !p.is_empty()).map(|(w, p)| (w as u32, p.as_slice())),
        )?;
        write_records(&paths.fidx(), num_docs, self.docs.iter().enumerate().map(|(d, e)| (d as u32, e.as_slice())))?;
        tracing::info!(num_docs, num_words, "inverted and forward index written");

        progress(STAGE_WEIGHTS, 0, 1);
        let weights = WeightModel::compute_from_docs(num_words, &self.docs);
        save_weights(paths, &weights.to_file())?;
        progress(STAGE_WEIGHTS, 1, 1);

        save_docs(paths, &self.metas)?;
        let meta = MetaFile { num_docs, num_words, created_at: now_rfc3339(), version: FORMAT_VERSION };
        save_meta(paths, &meta)?;
        tracing::info!(root = %paths.root.display(), "index build complete");
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_ids_beyond_the_limit_are_rejected() {
        let mut builder = IndexBuilder::with_vocabulary(4);
        assert_eq!(builder.add_document("a.jpg", vec![Entry::new(9, 1)]).unwrap(), 0);
        assert_eq!(builder.num_words(), 10);

        let err = builder.add_document("b.jpg", vec![Entry::new(1, 1), Entry::new(u32::MAX, 1)]).unwrap_err();
        assert!(matches!(err, Error::VocabularyOverflow { word: u32::MAX, .. }));
        assert!(builder.add_document("c.jpg", vec![Entry::new(MAX_VOCABULARY, 1)]).is_err());
        assert_eq!(builder.add_document("d.jpg", vec![Entry::new(MAX_VOCABULARY - 1, 1)]).unwrap(), 1);
        assert_eq!(builder.num_docs(), 2);
        assert_eq!(builder.num_words(), MAX_VOCABULARY);
    }

    #[test]
    fn oversized_vocabulary_is_rejected_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let paths = IndexPaths::new(dir.path().join("idx"));
        let builder = IndexBuilder::with_vocabulary(MAX_VOCABULARY + 1);
        assert!(matches!(builder.finish(&paths, &mut |_, _, _| {}), Err(Error::VocabularyOverflow { .. })));
        assert!(!paths.root.exists());
    }
}
