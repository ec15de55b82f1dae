#[macro_use]
extern crate log;

pub mod channel;
pub mod date;
pub mod file_handler;
pub mod header;
pub mod method;
pub mod request;
pub mod response;
pub mod status_code;
pub mod v1;
pub mod version;
