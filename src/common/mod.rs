pub mod config;
pub mod digest;
pub mod error;
pub mod instrument;

pub use config::*;
pub use digest::*;
pub use error::*;
pub use instrument::*;
