pub mod config_store;
pub mod diff;
pub mod listener;
pub mod router;

pub use config_store::ConfigStore;
pub use diff::{changed_fields, compare_field, FieldChange};
pub use listener::CommandListener;
pub use router::CommandRouter;
