//! The worker side of the bus.
//!
//! A worker process attaches to its engine's endpoint as a peer identified
//! by the slave id it was spawned with, announces itself with a heartbeat,
//! and then serves `invoke` requests with chunk/error/choke replies while
//! heartbeating periodically. This module is the dealer half of the wire
//! contract; the engine half lives in [`crate::rpc`].

use std::path::Path;

use bytes::Bytes;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use uuid::Uuid;

use crate::rpc::codec::{read_frame, write_envelope, CodecError, Envelope, RpcMessage};

/// One worker's connection to its engine.
pub struct WorkerSession {
    id: Uuid,
    read_half: OwnedReadHalf,
    write_half: OwnedWriteHalf,
}

impl WorkerSession {
    /// Connect to the engine's bus endpoint under the given identity.
    pub async fn connect(endpoint: &Path, id: Uuid) -> std::io::Result<Self> {
        let stream = UnixStream::connect(endpoint).await?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            id,
            read_half,
            write_half,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn heartbeat(&mut self) -> Result<(), CodecError> {
        self.send(RpcMessage::Heartbeat).await
    }

    pub async fn chunk(&mut self, data: Bytes) -> Result<(), CodecError> {
        self.send(RpcMessage::Chunk { data }).await
    }

    pub async fn error(&mut self, code: u32, message: impl Into<String>) -> Result<(), CodecError> {
        self.send(RpcMessage::Error {
            code,
            message: message.into(),
        })
        .await
    }

    pub async fn choke(&mut self) -> Result<(), CodecError> {
        self.send(RpcMessage::Choke).await
    }

    pub async fn terminate(&mut self) -> Result<(), CodecError> {
        self.send(RpcMessage::Terminate).await
    }

    /// The next engine-originated message (`invoke` or `terminate`), or
    /// `None` when the engine closed the connection.
    pub async fn recv(&mut self) -> Result<Option<RpcMessage>, CodecError> {
        loop {
            let Some(body) = read_frame(&mut self.read_half).await? else {
                return Ok(None);
            };
            let envelope = Envelope::decode(body)?;
            if envelope.slave_id != self.id {
                tracing::warn!(
                    own = %self.id,
                    claimed = %envelope.slave_id,
                    "Skipping an envelope addressed to a foreign peer"
                );
                continue;
            }
            return Ok(Some(envelope.message));
        }
    }

    async fn send(&mut self, message: RpcMessage) -> Result<(), CodecError> {
        write_envelope(&mut self.write_half, &Envelope::new(self.id, message)).await
    }
}
