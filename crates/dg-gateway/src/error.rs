//! Gateway error types

use dg_core::{SplitError, TemplateError};
use thiserror::Error;

/// Authentication failures
///
/// Every variant rejects the attempt. Details are logged, never sent to
/// the client.
#[derive(Error, Debug)]
pub enum AuthError {
    /// The hook could not be reached or run
    #[error("Hook transport failed: {0}")]
    HookTransport(String),

    /// HTTP hook answered with something other than 200
    #[error("Hook returned HTTP {0}")]
    HookStatus(u16),

    /// Script hook exited unsuccessfully
    #[error("Hook script exited with {0}")]
    HookExit(String),

    /// Hook output is not a policy document
    #[error("Hook returned invalid JSON: {0}")]
    HookDecode(#[from] serde_json::Error),

    /// Hook did not answer within the configured bound
    #[error("Hook timed out")]
    HookTimeout,

    /// Hooks are configured and none granted access
    #[error("Access not granted")]
    NotAllowed,

    /// Image is not in the allow-list
    #[error("Image not allowed: {0}")]
    ImageNotAllowed(String),
}

/// Container routing failures
#[derive(Error, Debug)]
pub enum RouterError {
    /// An argument template failed to render
    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    /// An inline argument string failed to split
    #[error("Split error: {0}")]
    Split(#[from] SplitError),

    /// The container runtime command failed
    #[error("Container runtime error: {0}")]
    Runtime(String),

    /// The container runtime did not answer in time
    #[error("Container runtime timed out")]
    Timeout,

    /// Nothing to execute
    #[error("No command to run")]
    NoCommand,
}

/// Terminal relay failures
#[derive(Error, Debug)]
pub enum RelayError {
    /// Pseudo-terminal allocation or resize failed
    #[error("PTY error: {0}")]
    Pty(String),

    /// The session process could not be started
    #[error("Failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },

    /// The SSH channel is gone
    #[error("Channel closed")]
    ChannelClosed,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
