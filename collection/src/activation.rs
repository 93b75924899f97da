use crate::collection::{CollectionError, CollectionResult, EntityCollection};
use crate::source::ListingSource;
use crate::types::FetchOutcome;
use tracing::debug;

/// Loads the first page of a collection when its container is opened.
///
/// Activation only fetches while the collection holds no items. Repeated
/// activations, or one racing an in-flight fetch, are absorbed by the
/// collection's own pending and completion guards.
#[derive(Debug, Clone, Copy)]
pub struct ActivationTrigger {
    page_size: usize,
}

impl ActivationTrigger {
    pub fn new(page_size: usize) -> CollectionResult<Self> {
        if page_size == 0 {
            return Err(CollectionError::InvalidArgument {
                message: "page size must be greater than 0".to_string(),
            });
        }
        Ok(Self { page_size })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Returns `None` when the collection already had items.
    pub async fn activate<S: ListingSource>(
        &self,
        collection: &EntityCollection<S>,
    ) -> CollectionResult<Option<FetchOutcome>> {
        if !collection.is_empty() {
            debug!(
                "{} already holds items, activation does nothing",
                collection.resource_path()
            );
            return Ok(None);
        }

        collection.fetch_next_page(self.page_size).await.map(Some)
    }
}
