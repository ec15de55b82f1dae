#[macro_use]
extern crate log;

pub mod endpoint;
pub mod ip;
pub mod listener;
pub mod scheduler;
