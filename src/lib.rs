pub mod bank;
pub mod common;
pub mod consensus;
pub mod network;
