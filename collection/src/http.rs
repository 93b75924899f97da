use crate::config::CollectionConfig;
use crate::source::{ListingSource, SourceError, SourceResult};
use crate::types::{Entity, Page, Slice};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, error};

/// Response bodies accepted from a listing endpoint.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ListingBody {
    Bare(Vec<Entity>),
    Counted {
        items: Vec<Entity>,
        #[serde(default)]
        count: Option<usize>,
    },
}

impl From<ListingBody> for Page {
    fn from(body: ListingBody) -> Self {
        match body {
            ListingBody::Bare(items) => Page::new(items),
            ListingBody::Counted { items, count } => Page { items, count },
        }
    }
}

/// Reads listings over HTTP with `GET {base_url}{path}/{start}:{stop}`.
pub struct HttpListingSource {
    client: reqwest::Client,
    config: CollectionConfig,
}

impl HttpListingSource {
    pub fn new(config: CollectionConfig) -> SourceResult<Self> {
        config
            .validate()
            .map_err(|msg| SourceError::InvalidConfig { message: msg })?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| SourceError::Unknown {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &CollectionConfig {
        &self.config
    }

    pub fn slice_url(&self, path: &str, slice: Slice) -> String {
        format!(
            "{}/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_matches('/'),
            slice
        )
    }

    fn handle_http_error(&self, err: reqwest::Error) -> SourceError {
        if err.is_timeout() {
            SourceError::Timeout {
                millis: self.config.timeout.as_millis(),
            }
        } else if err.is_connect() {
            SourceError::ServiceUnavailable {
                message: "Cannot connect to listing endpoint".to_string(),
            }
        } else if err.is_decode() {
            SourceError::Unknown {
                message: format!("Malformed listing response: {}", err),
            }
        } else {
            SourceError::Network(err)
        }
    }

    fn status_error(path: &str, status: reqwest::StatusCode, body: String) -> SourceError {
        match status.as_u16() {
            404 => SourceError::NotFound {
                path: path.to_string(),
            },
            401 | 403 => SourceError::Authentication,
            429 => SourceError::RateLimit,
            503 => SourceError::ServiceUnavailable {
                message: "Listing endpoint unavailable".to_string(),
            },
            code => SourceError::Endpoint {
                status: code,
                message: body,
            },
        }
    }
}

#[async_trait]
impl ListingSource for HttpListingSource {
    async fn fetch_slice(&self, path: &str, slice: Slice) -> SourceResult<Page> {
        let url = self.slice_url(path, slice);
        debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| self.handle_http_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("Listing request {} failed with status: {}", url, status);
            return Err(Self::status_error(path, status, error_text));
        }

        let bytes = response.bytes().await.map_err(|e| self.handle_http_error(e))?;
        let body: ListingBody = serde_json::from_slice(&bytes)?;
        Ok(body.into())
    }

    fn source_name(&self) -> &'static str {
        "http"
    }
}
