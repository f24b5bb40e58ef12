pub mod memory;

pub use memory::{MemoryAuditStore, MemoryStringStore};
