//! Kubernetes watch plumbing: the declarative watch config and the dynamic
//! List/Watch fleet it drives.

pub mod config;
pub mod fleet;

pub use config::{run_config_poller, WatchConfig, WatchSpec};
pub use fleet::WatcherFleet;
