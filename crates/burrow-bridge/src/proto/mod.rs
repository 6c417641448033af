mod error;
pub use error::*;

mod frame;
pub use frame::*;
