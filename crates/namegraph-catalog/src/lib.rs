pub mod builder;
pub mod cache;
pub mod catalog;
pub mod invalidation;
pub mod memory;

pub use builder::*;
pub use cache::*;
pub use catalog::*;
pub use invalidation::*;
pub use memory::*;
