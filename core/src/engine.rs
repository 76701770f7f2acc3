use crate::persist::{load_docs, load_meta, DbHandles, IndexPaths, MetaFile};
use crate::postings::IterStrategy;
use crate::retriever::{Query, Retriever, Scoring};
use crate::store::{IndexStore, Residency};
use crate::weights::WeightModel;
use crate::{DocId, DocMeta, Error, Result, Spatial};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineOptions {
    pub residency: Residency,
    pub scoring: Scoring,
    pub strategy: IterStrategy,
}

/// Axis aligned rectangle in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Region {
    /// Parses `x,y,w,h`.
    pub fn parse(s: &str) -> Option<Self> {
        let v: Vec<f32> = s.split(',').map(|p| p.trim().parse().ok()).collect::<Option<_>>()?;
        match v.as_slice() {
            &[x, y, width, height] if width >= 0.0 && height >= 0.0 => Some(Self { x, y, width, height }),
            _ => None,
        }
    }

    pub fn contains(&self, s: &Spatial) -> bool {
        s.x >= self.x && s.x <= self.x + self.width && s.y >= self.y && s.y <= self.y + self.height
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub doc_id: DocId,
    /// Only entries positioned inside the region form the query.
    pub region: Option<Region>,
    pub from: usize,
    /// Exclusive end of the result window; 0 means no end.
    pub to: usize,
    pub score_threshold: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NamedHit {
    pub doc_id: DocId,
    pub name: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryPage {
    /// Hits at or above the threshold before windowing.
    pub total_hits: usize,
    pub hits: Vec<NamedHit>,
}

/// One loaded search engine: its index, weights and document names.
pub struct Engine {
    id: String,
    meta: MetaFile,
    docs: Vec<DocMeta>,
    retriever: Retriever,
}

impl Engine {
    pub fn open(id: impl Into<String>, root: &Path, options: EngineOptions) -> Result<Self> {
        Self::open_with(id, root, options, &DbHandles::new())
    }

    pub fn open_with(id: impl Into<String>, root: &Path, options: EngineOptions, handles: &DbHandles) -> Result<Self> {
        let id = id.into();
        let paths = IndexPaths::new(root);
        let meta = load_meta(&paths)?;
        let store = IndexStore::load_with(&paths.iidx(), &paths.fidx(), options.residency, handles)?;
        if meta.num_docs != store.num_docs() || meta.num_words != store.num_words() {
            return Err(Error::CorruptIndex(format!(
                "meta.json describes {}/{} docs/words, index holds {}/{}",
                meta.num_docs, meta.num_words, store.num_docs(), store.num_words()
            )));
        }
        let weights = WeightModel::load(&paths.weights())?;
        let retriever = Retriever::builder()
            .store(Arc::new(store))
            .weights(Arc::new(weights))
            .scoring(options.scoring)
            .strategy(options.strategy)
            .build()?;
        let docs = load_docs(&paths)?;
        if docs.len() != meta.num_docs as usize {
            return Err(Error::CorruptIndex(format!("{} doc names for {} docs", docs.len(), meta.num_docs)));
        }
        tracing::info!(engine = %id, num_docs = meta.num_docs, ?options, "engine opened");
        Ok(Self { id, meta, docs, retriever })
    }

    /// Query with (a region of) an indexed image, then threshold and window the ranking.
    pub fn query(&self, req: &QueryRequest) -> Result<QueryPage> {
        let doc = self.retriever.store().entry(req.doc_id)?;
        let hits = match req.region {
            Some(region) => {
                let entries: Vec<_> = doc
                    .entries
                    .iter()
                    .filter(|e| e.spatial.as_ref().is_some_and(|s| region.contains(s)))
                    .cloned()
                    .collect();
                self.retriever.execute(Query::Bag(&entries), 0)?
            }
            None => self.retriever.execute(Query::Bag(&doc.entries), 0)?,
        };
        let hits: Vec<_> = hits.into_iter().filter(|h| h.score >= req.score_threshold).collect();
        let total_hits = hits.len();
        let end = if req.to == 0 { total_hits } else { req.to.min(total_hits) };
        let hits = hits
            .into_iter()
            .take(end)
            .skip(req.from)
            .map(|h| NamedHit { doc_id: h.doc_id, name: self.doc_name(h.doc_id).to_string(), score: h.score })
            .collect();
        Ok(QueryPage { total_hits, hits })
    }

    pub fn doc_name(&self, doc_id: DocId) -> &str {
        self.docs.get(doc_id as usize).map(|d| d.name.as_str()).unwrap_or("")
    }

    pub fn id(&self) -> &str { &self.id }
    pub fn meta(&self) -> &MetaFile { &self.meta }
    pub fn retriever(&self) -> &Retriever { &self.retriever }
}

pub fn engine_id(name: &str, version: &str) -> String { format!("{name}/{version}") }

fn valid_component(s: &str) -> bool {
    !s.is_empty() && !s.starts_with('.') && s.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Owns loaded engines. Readers clone an `Arc<Engine>`; a reload builds the
/// new instance first and swaps it in, so in-flight queries keep the old one.
/// On-demand instances of one engine share its open databases.
pub struct EngineManager {
    data_dir: PathBuf,
    options: EngineOptions,
    engines: RwLock<HashMap<String, Arc<Engine>>>,
    handles: DbHandles,
}

impl EngineManager {
    pub fn new<P: AsRef<Path>>(data_dir: P, options: EngineOptions) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            options,
            engines: RwLock::new(HashMap::new()),
            handles: DbHandles::new(),
        }
    }

    pub fn engine_dir(&self, name: &str, version: &str) -> Result<PathBuf> {
        if !valid_component(name) || !valid_component(version) {
            return Err(Error::UnknownEngine(engine_id(name, version)));
        }
        Ok(self.data_dir.join(name).join(version))
    }

    pub fn exists(&self, name: &str, version: &str) -> bool {
        self.engine_dir(name, version).map(|d| d.is_dir()).unwrap_or(false)
    }

    /// Load (or reload) an engine. On failure a previously loaded instance stays in place.
    pub fn load(&self, name: &str, version: &str) -> Result<Arc<Engine>> {
        let dir = self.engine_dir(name, version)?;
        let id = engine_id(name, version);
        if !dir.is_dir() {
            return Err(Error::UnknownEngine(id));
        }
        let engine = Arc::new(Engine::open_with(id.clone(), &dir, self.options, &self.handles)?);
        if self.engines.write().insert(id.clone(), engine.clone()).is_some() {
            tracing::info!(engine = %id, "engine replaced");
        }
        Ok(engine)
    }

    pub fn get(&self, name: &str, version: &str) -> Result<Arc<Engine>> {
        let id = engine_id(name, version);
        self.engines.read().get(&id).cloned().ok_or(Error::UnknownEngine(id))
    }

    pub fn unload(&self, name: &str, version: &str) -> bool {
        let id = engine_id(name, version);
        let removed = self.engines.write().remove(&id).is_some();
        if removed { tracing::info!(engine = %id, "engine unloaded"); }
        removed
    }

    pub fn loaded(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.engines.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn data_dir(&self) -> &Path { &self.data_dir }

    /// Record databases held open by loaded engines.
    pub fn open_databases(&self) -> usize { self.handles.live() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_parse_and_contains() {
        let r = Region::parse("10, 20, 30, 40").unwrap();
        assert!(r.contains(&Spatial { x: 10.0, y: 60.0, scale: 1.0, orientation: 0.0, ellipse: None }));
        assert!(!r.contains(&Spatial { x: 41.0, y: 30.0, scale: 1.0, orientation: 0.0, ellipse: None }));
        assert!(Region::parse("1,2,3").is_none());
        assert!(Region::parse("1,2,-3,4").is_none());
        assert!(Region::parse("a,2,3,4").is_none());
    }

    #[test]
    fn engine_names_cannot_escape_data_dir() {
        let manager = EngineManager::new("/tmp/engines", EngineOptions::default());
        assert!(manager.engine_dir("..", "1").is_err());
        assert!(manager.engine_dir("a/b", "1").is_err());
        assert_eq!(manager.engine_dir("ox5k", "v1").unwrap(), PathBuf::from("/tmp/engines/ox5k/v1"));
    }

    #[test]
    fn unknown_engine_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let manager = EngineManager::new(dir.path(), EngineOptions::default());
        assert!(!manager.exists("ox5k", "v1"));
        assert!(matches!(manager.load("ox5k", "v1"), Err(Error::UnknownEngine(_))));
        assert!(matches!(manager.get("ox5k", "v1"), Err(Error::UnknownEngine(_))));
        assert!(!manager.unload("ox5k", "v1"));
    }
}
