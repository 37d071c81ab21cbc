mod error;
mod lock;
mod state;
mod storage;

pub use error::StoreError;
pub use lock::IdLock;
pub use state::{ContainerState, Status};
pub use storage::FileStateStore;
