use crate::types::{Page, Slice};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Listing not found: {path}")]
    NotFound { path: String },

    #[error("Authentication failed")]
    Authentication,

    #[error("Rate limit exceeded")]
    RateLimit,

    #[error("Service unavailable: {message}")]
    ServiceUnavailable { message: String },

    #[error("Endpoint error ({status}): {message}")]
    Endpoint { status: u16, message: String },

    #[error("Fetch timed out after {millis}ms")]
    Timeout { millis: u128 },

    #[error("Fetch cancelled before it settled")]
    Cancelled,

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Unknown error: {message}")]
    Unknown { message: String },
}

pub type SourceResult<T> = Result<T, SourceError>;

/// A remote listing that can be read in slices.
///
/// Implementations return at most `slice.limit()` entities, in listing order.
/// Returning fewer signals the end of the listing.
#[async_trait]
pub trait ListingSource: Send + Sync {
    async fn fetch_slice(&self, path: &str, slice: Slice) -> SourceResult<Page>;

    fn source_name(&self) -> &'static str;
}

#[async_trait]
impl<S: ListingSource + ?Sized> ListingSource for std::sync::Arc<S> {
    async fn fetch_slice(&self, path: &str, slice: Slice) -> SourceResult<Page> {
        (**self).fetch_slice(path, slice).await
    }

    fn source_name(&self) -> &'static str {
        (**self).source_name()
    }
}
