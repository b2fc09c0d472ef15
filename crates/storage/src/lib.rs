//! Storage abstraction and implementations for devflow.
//!
//! This crate provides the persistence boundary the orchestration core relies
//! on, with an in-memory backend and a JSON-file reference implementation.

#![warn(missing_docs)]

pub mod trait_;
pub mod memory;
pub mod json_storage;

pub use trait_::{Storage, StorageError, Result};
pub use memory::MemoryStorage;
pub use json_storage::JsonStorage;
