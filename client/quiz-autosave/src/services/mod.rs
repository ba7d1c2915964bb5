pub mod autosave_controller;
pub mod backup_store;
pub mod change_buffer;
pub mod dev_state;
pub mod save_gateway;
pub mod storage;
pub(crate) mod sync_scheduler;

pub use autosave_controller::{AutosaveController, AutosaveError};
pub use backup_store::LocalBackupStore;
pub use change_buffer::ChangeBuffer;
pub use dev_state::DevServerState;
pub use save_gateway::{
    build_gateway, CredentialProvider, GatewayError, HttpSaveGateway, MockSaveGateway,
    SaveGateway, StaticToken,
};
pub use storage::{FileStore, KeyValueStore, MemoryStore, StorageError};
