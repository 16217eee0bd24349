pub mod batcher;
pub mod memory;
pub mod registry;
pub mod request;
pub mod scheduler;
pub mod worker;

pub use batcher::*;
pub use memory::*;
pub use registry::*;
pub use request::*;
pub use scheduler::*;
pub use worker::*;
