mod error;
mod loader;
mod types;

pub use error::SpecError;
pub use loader::SpecLoader;
pub use types::*;
