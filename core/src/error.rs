use crate::{DocId, WordId};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("document {0} not found")]
    NotFound(DocId),

    #[error("document {doc_id} out of range (num_docs = {num_docs})")]
    OutOfRange { doc_id: DocId, num_docs: u32 },

    #[error("corrupt index: {0}")]
    CorruptIndex(String),

    #[error("word {word} beyond the vocabulary limit of {limit} words")]
    VocabularyOverflow { word: WordId, limit: u32 },

    #[error("inconsistent weights: {0}")]
    InconsistentWeights(String),

    #[error("missing dependency: {0}")]
    MissingDependency(&'static str),

    #[error("unknown engine {0}")]
    UnknownEngine(String),

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self { Error::Serialization(e.to_string()) }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self { Error::Serialization(e.to_string()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_offending_document() {
        let err = Error::OutOfRange { doc_id: 7, num_docs: 3 };
        assert_eq!(err.to_string(), "document 7 out of range (num_docs = 3)");
    }

    #[test]
    fn bincode_errors_become_serialization() {
        let bad: std::result::Result<Vec<u32>, _> = bincode::deserialize(&[1u8]);
        let err: Error = bad.unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
