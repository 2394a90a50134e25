//! Error types for ghstats-rs.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("feed request failed: {0}")]
    Feed(#[from] reqwest::Error),

    #[error("feed returned {status} for {url}")]
    FeedStatus { status: u16, url: String },

    #[error("malformed feed payload: {0}")]
    MalformedPayload(String),

    /// The key exists in the query vocabulary but storage holds nothing for it.
    #[error("no data for {0}")]
    NoData(String),

    /// The backend could not be reached or failed mid-query.
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
