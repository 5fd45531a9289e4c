//! Command protocol - wire framing for peer-to-peer command exchange
//!
//! A request is a single length-prefixed JSON command object. A response is a
//! length-prefixed JSON status object followed by the raw payload bytes up to
//! end-of-stream.

use std::collections::BTreeMap;
use std::io;

use async_trait::async_trait;
use futures::prelude::*;
use libp2p::{request_response, StreamProtocol};
use serde::{Deserialize, Serialize};

/// Protocol identifiers
pub const COMMAND_PROTOCOL: &str = "/datanode/1.0.0";
pub const IDENTIFY_PROTOCOL: &str = "/datanode/id/1.0.0";

/// Largest accepted command object.
pub const MAX_REQUEST_SIZE: usize = 1024 * 1024;
/// Largest accepted status object.
pub const MAX_STATUS_SIZE: usize = 64 * 1024;
/// Largest payload buffered from a remote response.
pub const MAX_RESPONSE_BODY: u64 = 64 * 1024 * 1024;

/// Status object sent ahead of every response payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandStatus {
    pub http_status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
}

impl CommandStatus {
    pub fn ok() -> Self {
        Self {
            http_status: 200,
            error: None,
            headers: None,
        }
    }

    pub fn error(http_status: u16, message: impl Into<String>) -> Self {
        Self {
            http_status,
            error: Some(message.into()),
            headers: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.http_status == 200
    }
}

/// A fully buffered response as it travels over the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct WireResponse {
    pub status: CommandStatus,
    pub body: Vec<u8>,
}

/// Codec for command request/response
#[derive(Debug, Clone, Default)]
pub struct CommandCodec;

async fn read_prefixed<T>(io: &mut T, max: usize) -> io::Result<Vec<u8>>
where
    T: AsyncRead + Unpin + Send,
{
    let mut len_buf = [0u8; 4];
    io.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit {}", len, max),
        ));
    }
    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_prefixed<T>(io: &mut T, data: &[u8]) -> io::Result<()>
where
    T: AsyncWrite + Unpin + Send,
{
    let len_buf = (data.len() as u32).to_be_bytes();
    io.write_all(&len_buf).await?;
    io.write_all(data).await
}

#[async_trait]
impl request_response::Codec for CommandCodec {
    type Protocol = StreamProtocol;
    type Request = Vec<u8>;
    type Response = WireResponse;

    async fn read_request<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
    ) -> io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_prefixed(io, MAX_REQUEST_SIZE).await
    }

    async fn read_response<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
    ) -> io::Result<Self::Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        // Status first; its length tells us where the payload starts
        let status_bytes = read_prefixed(io, MAX_STATUS_SIZE).await?;
        let status: CommandStatus = serde_json::from_slice(&status_bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let mut body = Vec::new();
        io.take(MAX_RESPONSE_BODY).read_to_end(&mut body).await?;

        Ok(WireResponse { status, body })
    }

    async fn write_request<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
        request: Self::Request,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_prefixed(io, &request).await?;
        io.flush().await?;
        Ok(())
    }

    async fn write_response<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
        response: Self::Response,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        let status = serde_json::to_vec(&response.status)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        write_prefixed(io, &status).await?;
        io.write_all(&response.body).await?;
        io.flush().await?;
        io.close().await?;
        Ok(())
    }
}
