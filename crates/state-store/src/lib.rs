pub mod backend;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod record;
pub mod store;
pub mod version;

pub use backend::{BackendKind, StoreSettings, open_store};
pub use common::SagaId;
pub use error::{Result, StateStoreError};
pub use memory::InMemorySagaStateStore;
pub use postgres::PostgresSagaStateStore;
pub use record::SagaRecord;
pub use store::{SagaStateStore, SagaStateStoreExt, SaveOptions, StoreCapabilities, Visibility};
pub use version::Version;
