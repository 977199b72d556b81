//! Storage backends.
//!
//! - `memory`: a single-process store, also used to seed tenants from config
//! - `sqlite`: a file database shareable by several relay processes
//! - `test`: the memory store with hooks for waiting on detached recording

pub mod memory;
pub mod sqlite;
pub mod test;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use test::TestStore;
