//! Core engine components
//!
//! The chat engine drives the tool-calling exchange; the memory store is the
//! durable state the tools act on. The journal keeps a readable record of
//! finished exchanges.

mod chat;
pub mod journal;
pub mod memory;

pub use chat::{ChatEngine, ChatError};
pub use journal::{Journal, JournalEntry};
pub use memory::{MemoryItem, MemoryPaths, MemoryStore};
