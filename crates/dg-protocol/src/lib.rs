//! dg-protocol: SSH channel-request payloads for dockgate
//!
//! This crate decodes and encodes the binary payloads of the session
//! channel requests the gateway understands (`pty-req`, `window-change`,
//! `env`, `shell`, `exec`). The encodings follow RFC 4254 section 6.

pub mod error;
pub mod request;
pub mod wire;

pub use error::ProtocolError;
pub use request::{ChannelRequest, PtyRequest, WindowSize};
pub use wire::{PayloadReader, PayloadWriter};
