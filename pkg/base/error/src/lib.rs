// The one error surface of this workspace: every crate raises the same
// dynamic `failure` error and imports `Result` from here.
pub use failure::err_msg;
pub use failure::format_err;
pub use failure::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;
