use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};

use crate::{
    error::{ChainError, Result},
    sha256::Hash,
    types::{Block, Transaction},
};

pub const PROTOCOL_VERSION: u32 = 1;
/// Largest frame body accepted from a peer.
pub const MAX_MESSAGE_SIZE: u64 = 32 * 1024 * 1024;
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub enum InvKind {
    Block,
    Transaction,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
// Every message travels on its own connection; replies go back to `addr_from`.
pub enum Message {
    // Handshake: protocol version and the sender's chain height
    Version {
        version: u32,
        best_height: u64,
        addr_from: String,
    },
    // Known peer addresses
    Addr(Vec<String>),
    // Announcement of objects the sender holds
    Inv {
        addr_from: String,
        kind: InvKind,
        items: Vec<Hash>,
    },
    // Request: inventory of all block hashes
    GetBlocks { addr_from: String },
    // Request: one block or transaction
    GetData {
        addr_from: String,
        kind: InvKind,
        id: Hash,
    },
    Block { addr_from: String, block: Block },
    Tx {
        addr_from: String,
        transaction: Transaction,
    },
}

impl Message {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| ChainError::Serialization(format!("message: {e}")))?;
        Ok(bytes)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        ciborium::from_reader(data).map_err(|e| ChainError::CorruptData(format!("message: {e}")))
    }

    pub async fn send_async(&self, stream: &mut (impl AsyncWrite + Unpin)) -> Result<()> {
        let bytes = self.encode()?;
        let length = bytes.len() as u64;

        stream.write_all(&length.to_be_bytes()).await?;
        stream.write_all(&bytes).await?;
        stream.flush().await?;

        Ok(())
    }

    pub async fn receive_async(stream: &mut (impl AsyncRead + Unpin)) -> Result<Self> {
        let mut length_bytes = [0u8; 8];
        stream.read_exact(&mut length_bytes).await?;
        let length = u64::from_be_bytes(length_bytes);
        if length > MAX_MESSAGE_SIZE {
            return Err(ChainError::MessageTooLarge(length));
        }

        let mut data = vec![0u8; length as usize];
        stream.read_exact(&mut data).await?;

        Self::decode(&data)
    }

    /// Opens a connection to `address` and delivers this message on it.
    pub async fn send_to(&self, address: &str) -> Result<()> {
        let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(address))
            .await
            .map_err(|_| {
                ChainError::Network(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connecting to {address}"),
                ))
            })??;
        self.send_async(&mut stream).await?;
        stream.shutdown().await?;
        Ok(())
    }

    pub fn name(&self) -> &'static str {
        match self {
            Message::Version { .. } => "version",
            Message::Addr(_) => "addr",
            Message::Inv { .. } => "inv",
            Message::GetBlocks { .. } => "getblocks",
            Message::GetData { .. } => "getdata",
            Message::Block { .. } => "block",
            Message::Tx { .. } => "tx",
        }
    }
}
