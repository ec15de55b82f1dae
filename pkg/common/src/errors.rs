pub use failure::err_msg;
pub use failure::format_err;
pub use failure::Error;
pub use failure::Fail;

pub type Result<T, E = Error> = std::result::Result<T, E>;
