//! Terminal rendering of an entity collection.
//!
//! [`ListView`] is the observer side of a collection: it re-renders on every
//! fetch event and mirrors the completion flag into `more_visible`, the way a
//! list widget hides its "More" footer once the listing is exhausted.

use collection::{
    CollectionResult, Entity, EntityCollection, FetchEvent, FetchOutcome, ListingSource,
    Subscription,
};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

#[derive(Debug, Default)]
struct ViewState {
    lines: Vec<String>,
    more_visible: bool,
    last_error: Option<String>,
    renders: usize,
}

pub struct ListView<S> {
    collection: Arc<EntityCollection<S>>,
    state: Arc<Mutex<ViewState>>,
    _subscription: Subscription,
}

impl<S: ListingSource + 'static> ListView<S> {
    /// Bind a view to `collection`, displaying `field` of each entity.
    pub fn bind(collection: Arc<EntityCollection<S>>, field: impl Into<String>) -> Self {
        let field = field.into();
        let state = Arc::new(Mutex::new(ViewState {
            more_visible: !collection.is_complete(),
            ..ViewState::default()
        }));

        let subscription = {
            let state = state.clone();
            let view_of = Arc::downgrade(&collection);
            collection.subscribe(move |event: &FetchEvent| {
                let Some(collection) = view_of.upgrade() else {
                    return;
                };
                let lines: Vec<String> = collection.with_items(|items| {
                    items.iter().map(|item| render_entity(item, &field)).collect()
                });

                let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                state.lines = lines;
                state.more_visible = !event.complete;
                state.last_error = event.status.error().map(|err| err.to_string());
                state.renders += 1;
                debug!(
                    "Rendered {} entities (more: {})",
                    state.lines.len(),
                    state.more_visible
                );
            })
        };

        Self {
            collection,
            state,
            _subscription: subscription,
        }
    }

    /// The "More" action: fetch the next page of `page_size` entities.
    pub async fn load_more(&self, page_size: usize) -> CollectionResult<FetchOutcome> {
        self.collection.fetch_next_page(page_size).await
    }

    pub fn collection(&self) -> &EntityCollection<S> {
        &self.collection
    }

    pub fn lines(&self) -> Vec<String> {
        self.lock().lines.clone()
    }

    pub fn more_visible(&self) -> bool {
        self.lock().more_visible
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    pub fn render_count(&self) -> usize {
        self.lock().renders
    }

    pub fn render(&self) -> String {
        let state = self.lock();
        let mut out = String::new();
        for line in &state.lines {
            out.push_str("  - ");
            out.push_str(line);
            out.push('\n');
        }
        if let Some(err) = &state.last_error {
            out.push_str(&format!("  ! {}\n", err));
        }
        if state.more_visible {
            out.push_str("  [More]\n");
        }
        out
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ViewState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Display text for one entity: the chosen field, or the whole record as JSON.
pub fn render_entity(entity: &Entity, field: &str) -> String {
    match entity.text(field) {
        Some(text) => text.to_string(),
        None => serde_json::to_string(entity.fields()).unwrap_or_default(),
    }
}
