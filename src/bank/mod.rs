pub mod command;
pub mod ledger;

pub use command::*;
pub use ledger::*;
