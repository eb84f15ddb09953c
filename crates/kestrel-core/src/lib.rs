//! Shared domain types for the Kestrel test-station controller.

pub mod error;
pub mod store;
pub mod types;

pub use error::{KestrelError, Result};
pub use store::{MemoryStore, TestStore};
pub use types::*;
