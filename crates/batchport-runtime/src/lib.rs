pub mod collector;
pub mod compute;
pub mod engine;
pub mod responder;
pub mod state;

pub use collector::*;
pub use compute::*;
pub use engine::*;
pub use responder::*;
pub use state::*;
