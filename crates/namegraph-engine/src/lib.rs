pub mod batch;
pub mod conflict;
pub mod inheritance;
pub mod propagation;
pub mod service;
pub mod store;

pub use batch::*;
pub use conflict::*;
pub use inheritance::*;
pub use propagation::*;
pub use service::*;
pub use store::*;
