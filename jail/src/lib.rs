mod binding;
mod error;
mod kernel;
mod memory;
mod params;

pub use binding::{Attacher, JailBinding, JailHandle};
pub use error::JailError;
pub use kernel::{JAIL_CREATE, JAIL_UPDATE, KernelJails};
pub use memory::InMemoryJails;
pub use params::*;
