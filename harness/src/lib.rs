pub mod settings;
pub mod view;

pub use settings::{resolve_config, HarnessError, HarnessResult, Overrides, SettingsFile};
pub use view::{render_entity, ListView};
