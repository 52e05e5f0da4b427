use index_common::embedding::EmbeddingError;
use index_common::store::StoreError;
use index_common::vector::VectorIndexError;
use thiserror::Error;

/// Enumeration of errors that abort worker startup. Anything that happens
/// after startup is converted into a job status instead.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("invalid worker configuration: {0}")]
    Config(String),
    #[error("failed to reach the store: {0}")]
    Store(#[from] StoreError),
    #[error("failed to set up the embedding client: {0}")]
    Embedding(#[from] EmbeddingError),
    #[error("failed to set up the vector store client: {0}")]
    VectorStore(#[from] VectorIndexError),
}

/// Why a single job's processing attempt failed. The short reason string is
/// what lands in the job record's `error_message`.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("staged image could not be read")]
    ImageUnreadable,
    #[error("embedding failed: {0}")]
    Embedding(EmbeddingError),
    #[error("vector store upsert failed: {0}")]
    VectorStore(VectorIndexError),
    #[error("processing timed out")]
    Timeout,
}

impl ProcessError {
    /// Short failure reason for the job record.
    pub fn reason(&self) -> String {
        match self {
            ProcessError::ImageUnreadable => "image-unreadable".to_string(),
            ProcessError::Embedding(err) => format!("embedding-failed: {err}"),
            ProcessError::VectorStore(err) => format!("vector-store-failed: {err}"),
            ProcessError::Timeout => "timeout".to_string(),
        }
    }
}
