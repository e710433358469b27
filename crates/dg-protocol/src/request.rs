//! Session channel requests
//!
//! Request payload layouts (RFC 4254 section 6):
//!
//! | type            | payload                                                 |
//! |-----------------|---------------------------------------------------------|
//! | `pty-req`       | string TERM, uint32 cols, rows, width px, height px, string modes |
//! | `window-change` | uint32 cols, rows, width px, height px                  |
//! | `env`           | string name, string value                               |
//! | `shell`         | (empty)                                                 |
//! | `exec`          | string command                                          |

use crate::error::ProtocolError;
use crate::wire::{PayloadReader, PayloadWriter};

/// Terminal dimensions carried by `pty-req` and `window-change`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    /// Width in characters
    pub cols: u32,
    /// Height in characters
    pub rows: u32,
    /// Width in pixels
    pub pixel_width: u32,
    /// Height in pixels
    pub pixel_height: u32,
}

impl WindowSize {
    /// Create a character-cell size with no pixel dimensions
    pub fn new(cols: u32, rows: u32) -> Self {
        Self {
            cols,
            rows,
            pixel_width: 0,
            pixel_height: 0,
        }
    }

    fn read(reader: &mut PayloadReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            cols: reader.read_u32("width-chars")?,
            rows: reader.read_u32("height-chars")?,
            pixel_width: reader.read_u32("width-pixels")?,
            pixel_height: reader.read_u32("height-pixels")?,
        })
    }

    fn write(&self, writer: &mut PayloadWriter) {
        writer
            .put_u32(self.cols)
            .put_u32(self.rows)
            .put_u32(self.pixel_width)
            .put_u32(self.pixel_height);
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

/// Body of a `pty-req`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    /// Terminal type, e.g. `xterm-256color`
    pub term: String,
    /// Initial window size
    pub size: WindowSize,
    /// Encoded terminal modes, passed through untouched
    pub modes: Vec<u8>,
}

/// A decoded session channel request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequest {
    /// Allocate a pseudo-terminal
    PtyReq(PtyRequest),
    /// Terminal resized
    WindowChange(WindowSize),
    /// Set an environment variable
    Env { name: String, value: String },
    /// Start the default command
    Shell,
    /// Run a specific command line
    Exec { command: String },
    /// Any request type the gateway does not handle
    Other(String),
}

impl ChannelRequest {
    /// Decode a request from its type name and raw payload
    pub fn decode(kind: &str, payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = PayloadReader::new(payload);

        let request = match kind {
            "pty-req" => {
                let term = reader.read_string("term")?;
                let size = WindowSize::read(&mut reader)?;
                // Some clients omit the modes string entirely
                let modes = if reader.is_empty() {
                    Vec::new()
                } else {
                    reader.read_bytes("modes")?.to_vec()
                };
                ChannelRequest::PtyReq(PtyRequest { term, size, modes })
            }
            "window-change" => ChannelRequest::WindowChange(WindowSize::read(&mut reader)?),
            "env" => {
                let name = reader.read_string("name")?;
                let value = reader.read_string("value")?;
                ChannelRequest::Env { name, value }
            }
            "shell" => {
                if !payload.is_empty() {
                    return Err(ProtocolError::UnexpectedPayload {
                        kind: "shell",
                        len: payload.len(),
                    });
                }
                ChannelRequest::Shell
            }
            "exec" => {
                let raw = reader.read_bytes("command")?;
                ChannelRequest::Exec {
                    command: String::from_utf8_lossy(raw).into_owned(),
                }
            }
            other => ChannelRequest::Other(other.to_string()),
        };

        if !reader.is_empty() {
            tracing::debug!(
                "Ignoring {} trailing bytes in {} request",
                reader.remaining(),
                kind
            );
        }

        Ok(request)
    }

    /// Request type name as it appears on the wire
    pub fn kind(&self) -> &str {
        match self {
            ChannelRequest::PtyReq(_) => "pty-req",
            ChannelRequest::WindowChange(_) => "window-change",
            ChannelRequest::Env { .. } => "env",
            ChannelRequest::Shell => "shell",
            ChannelRequest::Exec { .. } => "exec",
            ChannelRequest::Other(kind) => kind,
        }
    }

    /// Encode the request payload
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = PayloadWriter::new();
        match self {
            ChannelRequest::PtyReq(pty) => {
                writer.put_string(&pty.term);
                pty.size.write(&mut writer);
                writer.put_bytes(&pty.modes);
            }
            ChannelRequest::WindowChange(size) => size.write(&mut writer),
            ChannelRequest::Env { name, value } => {
                writer.put_string(name).put_string(value);
            }
            ChannelRequest::Exec { command } => {
                writer.put_string(command);
            }
            ChannelRequest::Shell | ChannelRequest::Other(_) => {}
        }
        writer.finish()
    }
}
