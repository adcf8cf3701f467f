pub mod allocator;
pub mod cidr;
pub mod error;

pub use allocator::*;
pub use cidr::*;
pub use error::*;
