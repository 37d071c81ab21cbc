mod config;
mod controller;
mod error;
mod id;
mod reconcile;

#[cfg(test)]
mod tests;

pub use config::{
    CreateOptions, DEFAULT_DEVFS_RULESET_VMM, DEFAULT_DEVFS_RULESET_VNET, DEFAULT_ROOT,
    RuntimeConfig,
};
pub use controller::{LifecycleController, monitor_alive};
pub use error::LifecycleError;
pub use id::validate_id;
pub use jailrun_store::{ContainerState, Status};
