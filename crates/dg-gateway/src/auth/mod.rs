//! Authentication for the gateway
//!
//! Password, public-key and keyboard-interactive attempts are resolved
//! against the connection's session policy. External hooks (scripts or
//! HTTP endpoints) decide; without hooks only the image allow-list applies.

mod hook;
mod pipeline;

pub use hook::{hook_from_reference, HookRequest, HookTransport, HttpHook, ScriptHook};
pub use pipeline::{authorize, Authenticator};
