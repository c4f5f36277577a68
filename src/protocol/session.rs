use log::{debug, warn};

use super::codec;
use super::error::{CodecError, SessionError};
use super::messages::Message;
use crate::transport::Transport;

/// Message-level view of a [`Transport`]: one record out, one record in.
pub struct Session {
    transport: Transport,
}

impl Session {
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }

    pub async fn connect(&mut self) -> Result<(), SessionError> {
        Ok(self.transport.connect().await?)
    }

    pub async fn send(&mut self, message: &Message) -> Result<(), SessionError> {
        let bytes = codec::encode(message)?;
        self.transport.write(&bytes).await?;
        Ok(())
    }

    /// Reads until one whole record is buffered and returns it.
    ///
    /// A corrupt record closes the transport, since the remaining bytes can
    /// no longer be framed.
    pub async fn receive_one(&mut self) -> Result<Message, SessionError> {
        let mut attempt = codec::decode(self.transport.buffered());
        loop {
            match attempt {
                Ok((message, used)) => {
                    self.transport.consume(used)?;
                    return Ok(message);
                }
                Err(CodecError::Truncated) => {
                    let buffered = self.transport.read().await?;
                    debug!("Buffered {} bytes, trying to decode", buffered.len());
                    attempt = codec::decode(buffered);
                }
                Err(err) => {
                    warn!("Dropping connection after undecodable record: {}", err);
                    self.transport.close();
                    return Err(err.into());
                }
            }
        }
    }

    pub fn close(&mut self) {
        self.transport.close();
    }
}
