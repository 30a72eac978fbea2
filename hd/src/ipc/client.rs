//! IPC client - CLI and worker side of the unix socket

use std::path::Path;

use eyre::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::OwnedWriteHalf;

use super::messages::{IpcRequest, IpcResponse};

pub struct IpcClient {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl IpcClient {
    /// Connect to a running daemon
    pub async fn connect(socket_path: impl AsRef<Path>) -> Result<Self> {
        let stream = UnixStream::connect(socket_path.as_ref())
            .await
            .context("daemon not reachable; is it running?")?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    /// Whether a daemon is answering on the socket
    pub async fn is_alive(socket_path: impl AsRef<Path>) -> bool {
        match Self::connect(socket_path).await {
            Ok(mut client) => matches!(client.request(IpcRequest::Ping).await, Ok(IpcResponse::Pong { .. })),
            Err(_) => false,
        }
    }

    /// Send one request and read its response
    pub async fn request(&mut self, request: IpcRequest) -> Result<IpcResponse> {
        let mut payload = serde_json::to_string(&request)?;
        payload.push('\n');
        self.writer.write_all(payload.as_bytes()).await?;

        let mut line = String::new();
        let read = self.reader.read_line(&mut line).await?;
        if read == 0 {
            eyre::bail!("daemon closed the connection");
        }
        Ok(serde_json::from_str(&line)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_refused_without_daemon() {
        let result = IpcClient::connect("/tmp/hd-test-no-such-socket.sock").await;
        assert!(result.is_err());
        assert!(!IpcClient::is_alive("/tmp/hd-test-no-such-socket.sock").await);
    }
}
