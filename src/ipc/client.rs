//! UI side of the IPC channel

use super::{IpcRequest, IpcResponse, MAX_LINE_LENGTH};
use crate::utils::AppError;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};

/// A connection to the coordinator
pub struct IpcClient {
    framed: Framed<TcpStream, LinesCodec>,
}

impl IpcClient {
    pub async fn connect(addr: &str) -> Result<Self, AppError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self {
            framed: Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)),
        })
    }

    /// Send one request and wait for its response
    pub async fn request(&mut self, request: &IpcRequest) -> Result<IpcResponse, AppError> {
        let line = serde_json::to_string(request)?;
        self.framed
            .send(line)
            .await
            .map_err(|e| AppError::Protocol(e.to_string()))?;

        match self.framed.next().await {
            Some(Ok(line)) => Ok(serde_json::from_str(&line)?),
            Some(Err(e)) => Err(AppError::Protocol(e.to_string())),
            None => Err(AppError::Protocol("coordinator closed the connection".to_string())),
        }
    }
}
