//! UK Capital Gains Tax for employee share schemes (RSU vestings, ESPP purchases)

pub mod cmd;
pub mod core;
pub mod engine;
pub mod server;
pub mod store;
