pub mod activation;
pub mod collection;
pub mod config;
pub mod events;
pub mod http;
pub mod source;
pub mod types;

pub use activation::ActivationTrigger;
pub use collection::{CollectionError, CollectionResult, EntityCollection};
pub use config::CollectionConfig;
pub use events::{EventChannel, Subscription};
pub use http::HttpListingSource;
pub use source::{ListingSource, SourceError, SourceResult};
pub use types::{Entity, FetchEvent, FetchOutcome, FetchStatus, Page, Slice};

pub mod prelude {
    pub use crate::activation::*;
    pub use crate::collection::*;
    pub use crate::config::*;
    pub use crate::events::*;
    pub use crate::http::*;
    pub use crate::source::*;
    pub use crate::types::*;
}
