//! TCP relay that shapes every accepted connection.

mod server;
mod session;

pub use server::RelayServer;
pub use session::copy_stream;
