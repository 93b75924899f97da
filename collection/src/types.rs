use crate::source::SourceError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// An opaque record as returned by a listing endpoint.
///
/// The collection never interprets the fields; it only counts records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Entity(Map<String, Value>);

impl Entity {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// String value of `field`, if present and a string.
    pub fn text(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }
}

/// Half-open range `[start, stop)` of a listing, used as pagination cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slice {
    pub start: usize,
    pub stop: usize,
}

impl Slice {
    pub fn new(start: usize, limit: usize) -> Self {
        Self {
            start,
            stop: start.saturating_add(limit),
        }
    }

    pub fn limit(&self) -> usize {
        self.stop.saturating_sub(self.start)
    }
}

impl fmt::Display for Slice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.start, self.stop)
    }
}

/// One page returned by a listing source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub items: Vec<Entity>,
    /// Total number of entities in the listing, when the endpoint reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
}

impl Page {
    pub fn new(items: Vec<Entity>) -> Self {
        Self { items, count: None }
    }

    pub fn with_count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }
}

/// How a settled fetch went.
#[derive(Debug, Clone)]
pub enum FetchStatus {
    Success,
    /// The collection was already complete; no request was issued.
    Exhausted,
    Failed(Arc<SourceError>),
}

impl FetchStatus {
    pub fn is_success(&self) -> bool {
        !matches!(self, FetchStatus::Failed(_))
    }

    pub fn error(&self) -> Option<&SourceError> {
        match self {
            FetchStatus::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// Payload of the "fetch" event, emitted once per settled fetch.
#[derive(Debug, Clone)]
pub struct FetchEvent {
    pub status: FetchStatus,
    /// Entities appended by this fetch, in server order.
    pub new_items: Vec<Entity>,
    /// Number of items held after the fetch settled.
    pub total: usize,
    pub complete: bool,
}

/// What a call to `fetch_next_page` resolved to.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Fetched { added: usize, complete: bool },
    Exhausted,
    /// Another fetch was in flight; this call waited for it instead of
    /// issuing a request.
    Joined,
    Failed(Arc<SourceError>),
}

impl FetchOutcome {
    pub fn added(&self) -> usize {
        match self {
            FetchOutcome::Fetched { added, .. } => *added,
            _ => 0,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, FetchOutcome::Failed(_))
    }
}
