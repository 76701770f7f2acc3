use crate::{DocMeta, Error, Result};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{create_dir_all, remove_dir_all, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const FORMAT_VERSION: u32 = 2;

const RECORDS_TREE: &str = "records";
const META_TREE: &str = "meta";
const COUNT_KEY: &[u8] = b"count";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaFile {
    pub num_docs: u32,
    pub num_words: u32,
    pub created_at: String,
    pub version: u32,
}

/// idf indexed by word id, L2 norm indexed by doc id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WeightsFile {
    pub idf: Vec<f64>,
    pub doc_norm: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct IndexPaths {
    pub root: PathBuf,
}

impl IndexPaths {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self { root: root.as_ref().to_path_buf() }
    }
    pub fn iidx(&self) -> PathBuf { self.root.join("iidx.sled") }
    pub fn fidx(&self) -> PathBuf { self.root.join("fidx.sled") }
    pub fn weights(&self) -> PathBuf { self.root.join("weights.bin") }
    pub fn docs(&self) -> PathBuf { self.root.join("docs.bin") }
    pub fn meta(&self) -> PathBuf { self.root.join("meta.json") }
}

fn write_bincode<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() { create_dir_all(parent)?; }
    let mut f = File::create(path)?;
    let bytes = bincode::serialize(value)?;
    f.write_all(&bytes)?;
    Ok(())
}

fn read_bincode<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let mut f = File::open(path)?;
    let mut buf = Vec::new();
    f.read_to_end(&mut buf)?;
    bincode::deserialize(&buf).map_err(|e| Error::CorruptIndex(format!("{}: {e}", path.display())))
}

pub fn save_weights(paths: &IndexPaths, weights: &WeightsFile) -> Result<()> {
    write_bincode(&paths.weights(), weights)
}

pub fn load_weights(path: &Path) -> Result<WeightsFile> {
    read_bincode(path)
}

pub fn save_docs(paths: &IndexPaths, docs: &[DocMeta]) -> Result<()> {
    write_bincode(&paths.docs(), &docs)
}

pub fn load_docs(paths: &IndexPaths) -> Result<Vec<DocMeta>> {
    read_bincode(&paths.docs())
}

pub fn save_meta(paths: &IndexPaths, meta: &MetaFile) -> Result<()> {
    create_dir_all(&paths.root)?;
    let mut f = File::create(paths.meta())?;
    let json = serde_json::to_string_pretty(meta)?;
    f.write_all(json.as_bytes())?;
    Ok(())
}

pub fn load_meta(paths: &IndexPaths) -> Result<MetaFile> {
    let mut f = File::open(paths.meta())?;
    let mut buf = String::new();
    f.read_to_string(&mut buf)?;
    let meta: MetaFile = serde_json::from_str(&buf)?;
    Ok(meta)
}

pub fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

/// Write a fresh record database at `path`, replacing whatever was there.
/// Ids without a record are simply absent; `count` bounds the id space.
pub fn write_records<'a, T, I>(path: &Path, count: u32, records: I) -> Result<()>
where
    T: Serialize + 'a,
    I: IntoIterator<Item = (u32, &'a [T])>,
{
    if path.exists() { remove_dir_all(path)?; }
    let db = sled::open(path)?;
    let tree = db.open_tree(RECORDS_TREE)?;
    for (id, items) in records {
        if id >= count {
            return Err(Error::CorruptIndex(format!("record id {id} >= count {count}")));
        }
        tree.insert(id.to_be_bytes(), bincode::serialize(items)?)?;
    }
    db.open_tree(META_TREE)?.insert(COUNT_KEY, count.to_be_bytes().to_vec())?;
    db.flush()?;
    Ok(())
}

type OpenDbs = Arc<Mutex<HashMap<PathBuf, (sled::Db, usize)>>>;

/// Open sled databases by path. sled admits one opener per database, so every
/// reader of a path shares its handle while any lease is alive. The handle is
/// only ever opened or closed under the map lock.
#[derive(Default)]
pub struct DbHandles {
    open: OpenDbs,
}

impl DbHandles {
    pub fn new() -> Self { Self::default() }

    pub fn open(&self, path: &Path) -> Result<DbLease> {
        let mut open = self.open.lock();
        match open.get_mut(path) {
            Some((_, users)) => *users += 1,
            None => {
                let db = sled::open(path)?;
                open.insert(path.to_path_buf(), (db, 1));
            }
        }
        Ok(DbLease { path: path.to_path_buf(), open: self.open.clone() })
    }

    /// Databases some reader still holds.
    pub fn live(&self) -> usize { self.open.lock().len() }
}

/// One reader's claim on a shared database.
pub struct DbLease {
    path: PathBuf,
    open: OpenDbs,
}

impl DbLease {
    pub fn open_tree(&self, name: &str) -> Result<sled::Tree> {
        let open = self.open.lock();
        match open.get(&self.path) {
            Some((db, _)) => Ok(db.open_tree(name)?),
            None => Err(Error::CorruptIndex(format!("{} is not open", self.path.display()))),
        }
    }
}

impl Drop for DbLease {
    fn drop(&mut self) {
        let mut open = self.open.lock();
        if let Some((_, users)) = open.get_mut(&self.path) {
            *users -= 1;
            if *users == 0 {
                open.remove(&self.path);
            }
        }
    }
}

/// An opened record database: keyed by big-endian u32, values bincode `Vec<T>`.
pub struct RecordDb {
    pub tree: sled::Tree,
    pub count: u32,
    // Declared last: the tree goes before the lease releases the database.
    _lease: DbLease,
}

impl RecordDb {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with(path, &DbHandles::new())
    }

    /// Open through `handles`, reusing a database another reader already has open.
    pub fn open_with(path: &Path, handles: &DbHandles) -> Result<Self> {
        if !path.exists() {
            return Err(Error::CorruptIndex(format!("missing record database {}", path.display())));
        }
        let lease = handles.open(path)?;
        let tree = lease.open_tree(RECORDS_TREE)?;
        let count = match lease.open_tree(META_TREE)?.get(COUNT_KEY)? {
            Some(v) => decode_id(&v)?,
            None => return Err(Error::CorruptIndex(format!("{}: no record count", path.display()))),
        };
        if let Some((last, _)) = tree.last()? {
            let last = decode_id(&last)?;
            if last >= count {
                return Err(Error::CorruptIndex(format!("{}: record id {last} >= count {count}", path.display())));
            }
        }
        Ok(Self { tree, count, _lease: lease })
    }

    pub fn get<T: DeserializeOwned>(&self, id: u32) -> Result<Option<Vec<T>>> {
        match self.tree.get(id.to_be_bytes())? {
            Some(bytes) => Ok(Some(decode_record(id, &bytes)?)),
            None => Ok(None),
        }
    }

    /// Every record in ascending id order.
    pub fn scan<T: DeserializeOwned>(&self) -> impl Iterator<Item = Result<(u32, Vec<T>)>> + '_ {
        self.tree.iter().map(|kv| {
            let (k, v) = kv?;
            let id = decode_id(&k)?;
            Ok((id, decode_record(id, &v)?))
        })
    }
}

fn decode_id(bytes: &[u8]) -> Result<u32> {
    let arr: [u8; 4] = bytes
        .try_into()
        .map_err(|_| Error::CorruptIndex(format!("record key of {} bytes", bytes.len())))?;
    Ok(u32::from_be_bytes(arr))
}

fn decode_record<T: DeserializeOwned>(id: u32, bytes: &[u8]) -> Result<Vec<T>> {
    bincode::deserialize(bytes).map_err(|e| Error::CorruptIndex(format!("record {id}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Posting;

    #[test]
    fn records_round_trip_in_id_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("iidx.sled");
        let a = vec![Posting { doc_id: 0, tf: 2, spatial: None }];
        let b = vec![Posting { doc_id: 1, tf: 1, spatial: None }, Posting { doc_id: 3, tf: 1, spatial: None }];
        write_records(&path, 10, vec![(7, b.as_slice()), (2, a.as_slice())]).unwrap();

        let db = RecordDb::open(&path).unwrap();
        assert_eq!(db.count, 10);
        assert_eq!(db.get::<Posting>(7).unwrap().unwrap(), b);
        assert!(db.get::<Posting>(5).unwrap().is_none());
        let ids: Vec<u32> = db.scan::<Posting>().map(|r| r.unwrap().0).collect();
        assert_eq!(ids, vec![2, 7]);
    }

    #[test]
    fn record_beyond_count_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let items: Vec<Posting> = Vec::new();
        let err = write_records(&dir.path().join("x.sled"), 2, vec![(2, items.as_slice())]).unwrap_err();
        assert!(matches!(err, Error::CorruptIndex(_)));
    }

    #[test]
    fn missing_database_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(RecordDb::open(&dir.path().join("nope.sled")), Err(Error::CorruptIndex(_))));
    }

    #[test]
    fn shared_handles_allow_concurrent_readers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fidx.sled");
        let a = vec![Posting { doc_id: 0, tf: 1, spatial: None }];
        write_records(&path, 1, vec![(0, a.as_slice())]).unwrap();

        let handles = DbHandles::new();
        let first = RecordDb::open_with(&path, &handles).unwrap();
        let second = RecordDb::open_with(&path, &handles).unwrap();
        assert_eq!(handles.live(), 1);
        assert_eq!(second.get::<Posting>(0).unwrap().unwrap(), a);

        drop(first);
        assert_eq!(handles.live(), 1);
        drop(second);
        assert_eq!(handles.live(), 0);
        // The lock is gone once every reader has dropped its handle.
        assert_eq!(RecordDb::open(&path).unwrap().count, 1);
    }

    #[test]
    fn meta_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let paths = IndexPaths::new(dir.path());
        let meta = MetaFile { num_docs: 3, num_words: 4, created_at: now_rfc3339(), version: FORMAT_VERSION };
        save_meta(&paths, &meta).unwrap();
        let back = load_meta(&paths).unwrap();
        assert_eq!(back.num_docs, 3);
        assert_eq!(back.num_words, 4);
    }
}
