pub mod audit;
pub mod config;
pub mod error;
pub mod rule;
pub mod string;
pub mod taxonomy;
pub mod traits;
pub mod types;

pub use audit::*;
pub use config::*;
pub use error::*;
pub use rule::*;
pub use string::*;
pub use taxonomy::*;
pub use traits::*;
pub use types::*;
