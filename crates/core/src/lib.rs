pub mod config;
pub mod error;
pub mod event;
pub mod scheduler;
pub mod session_store;

pub use error::{ConfigError, EventBusError, StoreError};
