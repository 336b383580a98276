//! Ingestion service error types

use newswire_common::AppError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestionError {
    #[error("Malformed batch body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(#[source] AppError),
}

impl From<IngestionError> for AppError {
    /// Decode failures keep their serialization kind so the consumer
    /// dead-letters them without redelivery
    fn from(e: IngestionError) -> Self {
        match e {
            IngestionError::Decode(e) => AppError::Serialization(e),
            IngestionError::Storage(e) => e,
        }
    }
}
