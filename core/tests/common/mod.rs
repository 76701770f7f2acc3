#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use visearch_core::build::IndexBuilder;
use visearch_core::persist::IndexPaths;
use visearch_core::*;

/// doc0 = {w1 x2, w2}, doc1 = {w1}, doc2 = {w3}; word 0 never occurs.
pub fn scenario_docs() -> Vec<Vec<Entry>> {
    vec![
        vec![Entry::new(1, 2), Entry::new(2, 1)],
        vec![Entry::new(1, 1)],
        vec![Entry::new(3, 1)],
    ]
}

/// Deterministic pseudo random corpus with repeated words and positions.
pub fn random_docs(num_docs: usize, num_words: u32, seed: u64) -> Vec<Vec<Entry>> {
    let mut state = seed;
    let mut next = move || {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (state >> 33) as u32
    };
    (0..num_docs)
        .map(|_| {
            let len = next() % 12;
            (0..len)
                .map(|_| {
                    let word = next() % num_words;
                    let spatial = Spatial { x: (next() % 100) as f32, y: (next() % 100) as f32, scale: 1.0, orientation: 0.0, ellipse: Some([1.0, 0.0, 1.0]) };
                    Entry::new(word, 1 + next() % 2).with_spatial(spatial)
                })
                .collect()
        })
        .collect()
}

pub fn build(dir: &Path, num_words: u32, docs: &[Vec<Entry>]) -> IndexPaths {
    let mut builder = IndexBuilder::with_vocabulary(num_words);
    for (i, entries) in docs.iter().enumerate() {
        builder.add_document(format!("img{i:03}.jpg"), entries.clone()).unwrap();
    }
    let paths = IndexPaths::new(dir);
    builder.finish(&paths, &mut |_, _, _| {}).unwrap();
    paths
}

pub fn retriever(paths: &IndexPaths, residency: Residency, strategy: IterStrategy, scoring: Scoring) -> Retriever {
    let store = load_index(&paths.iidx(), &paths.fidx(), residency).unwrap();
    let weights = load_weights(&paths.weights()).unwrap();
    Retriever::builder()
        .store(Arc::new(store))
        .weights(Arc::new(weights))
        .strategy(strategy)
        .scoring(scoring)
        .build()
        .unwrap()
}

/// Cosine of idf-weighted tf vectors, computed directly from the documents.
pub fn brute_force(docs: &[Vec<Entry>], num_words: u32, query: &[Entry]) -> BTreeMap<DocId, f64> {
    let model = WeightModel::compute_from_docs(num_words, docs);
    let tf = |entries: &[Entry]| {
        let mut m: BTreeMap<WordId, f64> = BTreeMap::new();
        for e in entries { *m.entry(e.word).or_insert(0.0) += e.tf as f64 * model.idf(e.word); }
        m
    };
    let q = tf(query);
    let q_norm = q.values().map(|v| v * v).sum::<f64>().sqrt();
    let mut out = BTreeMap::new();
    for (doc_id, entries) in docs.iter().enumerate() {
        let d = tf(entries);
        let d_norm = d.values().map(|v| v * v).sum::<f64>().sqrt();
        let dot: f64 = q.iter().filter_map(|(w, qv)| d.get(w).map(|dv| qv * dv)).sum();
        if dot != 0.0 && d_norm != 0.0 && q_norm != 0.0 {
            out.insert(doc_id as DocId, dot / (q_norm * d_norm));
        }
    }
    out
}
