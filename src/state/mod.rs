//! Durable task storage.
//!
//! The task lifecycle manager reads and writes tasks through the
//! `TaskStore` trait; this module provides the in-memory and JSON-file
//! implementations.

mod store;

pub use store::{JsonFileTaskStore, MemoryTaskStore, TaskStore};
