pub mod codec;
pub mod node;

pub use codec::*;
pub use node::*;
