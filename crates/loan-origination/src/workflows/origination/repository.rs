use super::lifecycle::{LoanId, LoanRecord};

/// Storage abstraction so the controller and tracker can be exercised in isolation.
pub trait LoanRepository: Send + Sync {
    fn insert(&self, record: LoanRecord) -> Result<LoanRecord, RepositoryError>;
    fn update(&self, record: LoanRecord) -> Result<(), RepositoryError>;
    fn fetch(&self, id: &LoanId) -> Result<Option<LoanRecord>, RepositoryError>;
    fn list_for_owner(&self, owner: &str) -> Result<Vec<LoanRecord>, RepositoryError>;
}

/// Error enumeration for repository failures.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("record already exists")]
    Conflict,
    #[error("record not found")]
    NotFound,
    #[error("repository unavailable: {0}")]
    Unavailable(String),
}
