//! SSH server implementation

mod handler;
mod listener;

pub use handler::{ClientHandler, ServerConfig};
pub use listener::{load_host_key, SshServer};
