use std::io;

use thiserror::Error;

use crate::geocoder::ServiceId;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error("{0}")]
    Config(String),
    #[error("{service} geocoding failed: {message}")]
    Geocode { service: ServiceId, message: String },
    #[error("{0} rate limit exceeded")]
    RateLimited(ServiceId),
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
    #[error("worker failed: {0}")]
    Worker(String),
    #[error("batch cancelled before completion")]
    Cancelled,
}
