pub mod error;
pub mod host;
pub mod instance;
pub mod spec;
pub mod tensor;

pub use error::*;
pub use host::*;
pub use instance::*;
pub use spec::*;
pub use tensor::*;
