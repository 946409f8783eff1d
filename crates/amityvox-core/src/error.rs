use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("not found")]
    NotFound,
    #[error("forbidden")]
    Forbidden,
    #[error("missing permission")]
    MissingPermission,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<amityvox_db::DbError> for CoreError {
    fn from(e: amityvox_db::DbError) -> Self {
        match e {
            amityvox_db::DbError::NotFound => CoreError::NotFound,
            amityvox_db::DbError::Sqlx(e) => CoreError::Database(e),
        }
    }
}
