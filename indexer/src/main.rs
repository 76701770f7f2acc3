use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing_subscriber::{fmt, EnvFilter};
use visearch_core::build::{IndexBuilder, MAX_VOCABULARY};
use visearch_core::persist::{load_meta, now_rfc3339, IndexPaths};
use visearch_core::progress::{ProgressLine, STAGE_INGEST};
use visearch_core::{load_index, load_weights, Entry, Residency, Spatial, WeightModel};
use walkdir::WalkDir;

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// One image after nearest-neighbour assignment of its descriptors.
#[derive(Debug, Deserialize)]
struct InputDoc {
    name: String,
    #[serde(default)]
    entries: Vec<InputEntry>,
    /// Shorthand for entries without geometry, one per occurrence.
    #[serde(default)]
    words: Vec<u32>,
}

#[derive(Debug, Deserialize)]
struct InputEntry {
    word: u32,
    #[serde(default = "one")]
    tf: u32,
    x: Option<f32>,
    y: Option<f32>,
    #[serde(default = "one_f32")]
    scale: f32,
    #[serde(default)]
    orientation: f32,
    ellipse: Option<[f32; 3]>,
}

fn one() -> u32 { 1 }
fn one_f32() -> f32 { 1.0 }

impl InputDoc {
    fn into_entries(self) -> (String, Vec<Entry>) {
        let mut entries: Vec<Entry> = self
            .entries
            .into_iter()
            .map(|e| {
                let entry = Entry::new(e.word, e.tf);
                match (e.x, e.y) {
                    (Some(x), Some(y)) => entry.with_spatial(Spatial { x, y, scale: e.scale, orientation: e.orientation, ellipse: e.ellipse }),
                    _ => entry,
                }
            })
            .collect();
        entries.extend(self.words.into_iter().map(|w| Entry::new(w, 1)));
        (self.name, entries)
    }
}

#[derive(Parser)]
#[command(name = "indexer")]
#[command(about = "Build and verify visual word indexes", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the index from assignment JSON/JSONL files or a directory of them
    Build {
        /// Input path (file or directory)
        #[arg(long)]
        input: String,
        /// Output index directory
        #[arg(long)]
        output: String,
        /// Vocabulary size of the clustering (defaults to the largest word id + 1)
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..=MAX_VOCABULARY as i64))]
        num_words: Option<u32>,
    },
    /// Recompute weights from the forward index and compare with the stored ones
    Verify {
        #[arg(long)]
        index: String,
    },
}

fn main() -> Result<()> {
    // stdout carries progress lines only.
    fmt().with_env_filter(EnvFilter::from_default_env()).with_writer(std::io::stderr).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Build { input, output, num_words } => build_index(Path::new(&input), Path::new(&output), num_words),
        Commands::Verify { index } => verify_index(Path::new(&index)),
    }
}

fn report(stage: &str, done: u64, count: u64) {
    let mut out = std::io::stdout().lock();
    // A closed pipe only loses status; the build itself goes on.
    let _ = writeln!(out, "{}", ProgressLine::format(stage, &now_rfc3339(), done, count));
    let _ = out.flush();
}

fn input_files(input: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = Vec::new();
    if input.is_dir() {
        for entry in WalkDir::new(input).into_iter().filter_map(|e| e.ok()) {
            let p = entry.path();
            if p.is_file() && matches!(p.extension().and_then(|s| s.to_str()), Some("json" | "jsonl")) {
                files.push(p.to_path_buf());
            }
        }
        // Doc ids follow file order.
        files.sort();
    } else if input.is_file() {
        files.push(input.to_path_buf());
    } else {
        bail!("input {} does not exist", input.display());
    }
    Ok(files)
}

fn build_index(input: &Path, output: &Path, num_words: Option<u32>) -> Result<()> {
    if let Some(n) = num_words.filter(|&n| n > MAX_VOCABULARY) {
        bail!("vocabulary of {n} words exceeds the limit of {MAX_VOCABULARY}");
    }
    let files = input_files(input)?;
    let mut builder = match num_words {
        Some(n) => IndexBuilder::with_vocabulary(n),
        None => IndexBuilder::new(),
    };

    report(STAGE_INGEST, 0, files.len() as u64);
    for (i, file) in files.iter().enumerate() {
        let docs = read_docs(file).with_context(|| format!("reading {}", file.display()))?;
        for doc in docs {
            let (name, entries) = doc.into_entries();
            builder.add_document(name, entries).with_context(|| format!("indexing {}", file.display()))?;
        }
        report(STAGE_INGEST, i as u64 + 1, files.len() as u64);
    }
    tracing::info!(num_docs = builder.num_docs(), num_words = builder.num_words(), "ingested assignments");

    let paths = IndexPaths::new(output);
    let meta = builder.finish(&paths, &mut report)?;
    tracing::info!(output = %output.display(), num_docs = meta.num_docs, "index build complete");
    Ok(())
}

fn read_docs(file: &Path) -> Result<Vec<InputDoc>> {
    let reader = BufReader::new(File::open(file)?);
    if file.extension().and_then(|s| s.to_str()) == Some("jsonl") {
        let mut docs = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() { continue; }
            docs.push(serde_json::from_str(&line)?);
        }
        return Ok(docs);
    }
    let json: serde_json::Value = serde_json::from_reader(reader)?;
    Ok(match json {
        serde_json::Value::Array(arr) => arr.into_iter().map(serde_json::from_value).collect::<Result<_, _>>()?,
        serde_json::Value::Object(_) => vec![serde_json::from_value(json)?],
        _ => Vec::new(),
    })
}

fn verify_index(root: &Path) -> Result<()> {
    let paths = IndexPaths::new(root);
    let meta = load_meta(&paths)?;
    let store = load_index(&paths.iidx(), &paths.fidx(), Residency::InMemory)?;
    let stored = load_weights(&paths.weights())?;
    stored.check_against(&store)?;
    let recomputed = WeightModel::compute(&store)?;
    stored.compare(&recomputed)?;
    tracing::info!(num_docs = meta.num_docs, num_words = meta.num_words, created_at = %meta.created_at, "index verified");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_and_word_shorthand_merge() {
        let doc: InputDoc = serde_json::from_str(
            r#"{"name":"a.jpg","entries":[{"word":3,"x":1.0,"y":2.0},{"word":4,"tf":2}],"words":[7,7]}"#,
        )
        .unwrap();
        let (name, entries) = doc.into_entries();
        assert_eq!(name, "a.jpg");
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].spatial.unwrap().x, 1.0);
        assert_eq!(entries[1].tf, 2);
        assert!(entries[1].spatial.is_none());
        assert_eq!(entries[3].word, 7);
    }

    #[test]
    fn build_then_verify() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in");
        std::fs::create_dir_all(&input).unwrap();
        std::fs::write(input.join("b.jsonl"), "{\"name\":\"2.jpg\",\"words\":[3]}\n\n{\"name\":\"3.jpg\",\"words\":[]}\n").unwrap();
        std::fs::write(input.join("a.json"), r#"[{"name":"0.jpg","words":[1,1,2]},{"name":"1.jpg","words":[1]}]"#).unwrap();
        let out = dir.path().join("index");

        build_index(&input, &out, Some(5)).unwrap();
        verify_index(&out).unwrap();
        let meta = load_meta(&IndexPaths::new(&out)).unwrap();
        assert_eq!((meta.num_docs, meta.num_words), (4, 5));
    }

    #[test]
    fn vocabulary_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("a.json");
        std::fs::write(&input, format!(r#"{{"name":"0.jpg","words":[{}]}}"#, u32::MAX)).unwrap();
        let err = build_index(&input, &dir.path().join("out"), None).unwrap_err();
        assert!(format!("{err:#}").contains("vocabulary limit"), "{err:#}");
        assert!(build_index(&input, &dir.path().join("out"), Some(MAX_VOCABULARY + 1)).is_err());

        assert!(Cli::try_parse_from(["indexer", "build", "--input", "a", "--output", "b", "--num-words", "4294967295"]).is_err());
        assert!(Cli::try_parse_from(["indexer", "build", "--input", "a", "--output", "b", "--num-words", "16"]).is_ok());
    }

    #[test]
    fn missing_input_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(build_index(&dir.path().join("nope"), &dir.path().join("out"), None).is_err());
    }
}
