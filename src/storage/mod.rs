pub mod data_store;
pub mod version_log;

pub use data_store::{DataStore, StoreStats};
pub use version_log::{VersionLog, VersionRecord};
