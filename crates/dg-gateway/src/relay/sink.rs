//! Output side of an SSH session channel

use async_trait::async_trait;
use russh::server::Handle;
use russh::{ChannelId, CryptoVec};

use crate::error::RelayError;

/// Extended-data stream code for stderr
pub const STDERR_STREAM: u32 = 1;

/// Everything the relay sends back to the client
#[async_trait]
pub trait ChannelSink: Send + Sync {
    /// Regular channel data
    async fn data(&self, data: &[u8]) -> Result<(), RelayError>;

    /// Extended data on stream `code`
    async fn extended_data(&self, code: u32, data: &[u8]) -> Result<(), RelayError>;

    /// `exit-status` request
    async fn exit_status(&self, code: u32) -> Result<(), RelayError>;

    /// End of output
    async fn eof(&self) -> Result<(), RelayError>;

    /// Close the channel
    async fn close(&self) -> Result<(), RelayError>;
}

/// [`ChannelSink`] writing to a russh session channel
#[derive(Clone)]
pub struct SessionSink {
    handle: Handle,
    channel: ChannelId,
}

impl SessionSink {
    pub fn new(handle: Handle, channel: ChannelId) -> Self {
        Self { handle, channel }
    }
}

#[async_trait]
impl ChannelSink for SessionSink {
    async fn data(&self, data: &[u8]) -> Result<(), RelayError> {
        self.handle
            .data(self.channel, CryptoVec::from_slice(data))
            .await
            .map_err(|_| RelayError::ChannelClosed)
    }

    async fn extended_data(&self, code: u32, data: &[u8]) -> Result<(), RelayError> {
        self.handle
            .extended_data(self.channel, code, CryptoVec::from_slice(data))
            .await
            .map_err(|_| RelayError::ChannelClosed)
    }

    async fn exit_status(&self, code: u32) -> Result<(), RelayError> {
        self.handle
            .exit_status_request(self.channel, code)
            .await
            .map_err(|_| RelayError::ChannelClosed)
    }

    async fn eof(&self) -> Result<(), RelayError> {
        self.handle
            .eof(self.channel)
            .await
            .map_err(|_| RelayError::ChannelClosed)
    }

    async fn close(&self) -> Result<(), RelayError> {
        self.handle
            .close(self.channel)
            .await
            .map_err(|_| RelayError::ChannelClosed)
    }
}
