//! Byte streams carried behind command statuses and storage reads.

use std::io;
use std::pin::Pin;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Boxed stream of byte chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

const READ_CHUNK: usize = 64 * 1024;

/// A stream yielding a single chunk.
pub fn once(bytes: impl Into<Bytes>) -> ByteStream {
    let bytes = bytes.into();
    Box::pin(futures::stream::once(async move { Ok(bytes) }))
}

/// Wrap an async reader, yielding chunks until EOF.
pub fn from_reader<R>(reader: R) -> ByteStream
where
    R: AsyncRead + Send + Unpin + 'static,
{
    Box::pin(futures::stream::unfold(Some(reader), |state| async move {
        let mut reader = state?;
        let mut buf = vec![0u8; READ_CHUNK];
        match reader.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(Bytes::from(buf)), Some(reader)))
            }
            Err(e) => Some((Err(e), None)),
        }
    }))
}

/// Drain a stream into memory, failing once `limit` bytes are exceeded.
pub async fn collect(mut stream: ByteStream, limit: usize) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if out.len() + chunk.len() > limit {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("stream exceeds {} bytes", limit),
            ));
        }
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reader_stream_roundtrip() {
        let data = vec![7u8; READ_CHUNK * 2 + 10];
        let stream = from_reader(std::io::Cursor::new(data.clone()));
        let collected = collect(stream, usize::MAX).await.unwrap();
        assert_eq!(collected, data);
    }

    #[tokio::test]
    async fn test_collect_limit() {
        let err = collect(once(vec![0u8; 16]), 8).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
