//! dg-gateway: SSH gateway into Docker containers
//!
//! The gateway accepts SSH connections, authenticates them through external
//! hooks, and attaches each session channel to a container selected by the
//! connection's policy: joining a running one or launching a new one.

pub mod auth;
pub mod dispatch;
pub mod error;
pub mod relay;
pub mod router;
pub mod server;
pub mod state;

pub use error::{AuthError, RelayError, RouterError};
pub use state::GatewayState;
