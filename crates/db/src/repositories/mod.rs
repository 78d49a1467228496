use prechat_core::storage::StoreError;
use thiserror::Error;

pub mod state_store;

pub use state_store::{NamespaceSummary, SqlStateStore};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<RepositoryError> for StoreError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::Database(error) => StoreError::Backend(error.to_string()),
            RepositoryError::Decode(detail) => {
                StoreError::Decode { namespace: String::new(), key: String::new(), detail }
            }
        }
    }
}
