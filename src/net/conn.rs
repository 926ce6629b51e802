use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;

/// Buffered TCP connection wrapper with an internal read buffer for incremental
/// protocol parsing. Any bytes read ahead of what the caller consumed (e.g. while
/// scanning for a header terminator) stay in `read_buffer` and are drained before
/// falling back to the socket, so a `BufferedConnection` can also be handed to
/// `tokio::io::copy`-style code or used as one side of a relay without losing
/// read-ahead data.
pub struct BufferedConnection {
    stream: TcpStream,
    read_buffer: Vec<u8>,
    temp_buffer: Vec<u8>,
}

impl BufferedConnection {
    pub fn new(stream: TcpStream, buffer_size: usize) -> Self {
        BufferedConnection {
            stream,
            read_buffer: Vec::with_capacity(buffer_size),
            temp_buffer: vec![0u8; buffer_size],
        }
    }

    pub fn peer_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.stream.peer_addr()
    }

    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.stream.set_nodelay(nodelay)
    }

    /// Reads a chunk from the socket into the internal read buffer. Returns the
    /// number of bytes read; `0` means the peer closed its write side.
    async fn fill(&mut self) -> io::Result<usize> {
        let n = self.stream.read(&mut self.temp_buffer).await?;
        if n > 0 {
            self.read_buffer.extend_from_slice(&self.temp_buffer[..n]);
        }
        Ok(n)
    }

    fn take_from_buffer(&mut self, len: usize) -> Option<Vec<u8>> {
        if self.read_buffer.len() >= len {
            let data = self.read_buffer[..len].to_vec();
            self.read_buffer.drain(..len);
            Some(data)
        } else {
            None
        }
    }

    /// Reads exactly `n` bytes, blocking until enough data is available.
    pub async fn read_exact_bytes(&mut self, n: usize) -> io::Result<Vec<u8>> {
        while self.read_buffer.len() < n {
            if self.fill().await? == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed"));
            }
        }
        self.take_from_buffer(n)
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "buffer underflow"))
    }

    /// Reads a single CRLF-terminated line, returning it without the terminator.
    /// Counts bytes consumed against `budget` and fails with `InvalidData` once
    /// it would be exceeded — used to bound the total size of a parsed request
    /// head.
    pub async fn read_line_bounded(&mut self, budget: &mut usize) -> io::Result<Vec<u8>> {
        loop {
            if let Some(pos) = self.read_buffer.windows(2).position(|w| w == b"\r\n") {
                if pos + 2 > *budget {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, "head too large"));
                }
                let line = self.read_buffer[..pos].to_vec();
                self.read_buffer.drain(..pos + 2);
                *budget -= pos + 2;
                return Ok(line);
            }
            if self.read_buffer.len() > *budget {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "head too large"));
            }
            if self.fill().await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before line terminator",
                ));
            }
        }
    }

    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data).await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }

    pub fn has_buffered_data(&self) -> bool {
        !self.read_buffer.is_empty()
    }
}

impl AsyncRead for BufferedConnection {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.read_buffer.is_empty() {
            let to_copy = std::cmp::min(this.read_buffer.len(), buf.remaining());
            buf.put_slice(&this.read_buffer[..to_copy]);
            this.read_buffer.drain(..to_copy);
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for BufferedConnection {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (BufferedConnection, BufferedConnection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (
            BufferedConnection::new(client, 4096),
            BufferedConnection::new(server, 4096),
        )
    }

    #[tokio::test]
    async fn reads_exact_bytes() {
        let (mut client, mut server) = pair().await;
        client.write_all(b"Hello, server!").await.unwrap();
        let data = server.read_exact_bytes(14).await.unwrap();
        assert_eq!(data, b"Hello, server!");
    }

    #[tokio::test]
    async fn reads_bounded_lines() {
        let (mut client, mut server) = pair().await;
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();

        let mut budget = 1024usize;
        let line1 = server.read_line_bounded(&mut budget).await.unwrap();
        assert_eq!(line1, b"GET / HTTP/1.1");
        let line2 = server.read_line_bounded(&mut budget).await.unwrap();
        assert_eq!(line2, b"Host: example.com");
        let line3 = server.read_line_bounded(&mut budget).await.unwrap();
        assert_eq!(line3, b"");
    }

    #[tokio::test]
    async fn rejects_oversized_head() {
        let (mut client, mut server) = pair().await;
        client.write_all(&vec![b'a'; 100]).await.unwrap();
        client.write_all(b"\r\n").await.unwrap();

        let mut budget = 10usize;
        let err = server.read_line_bounded(&mut budget).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn drains_buffered_bytes_through_async_read() {
        let (mut client, mut server) = pair().await;
        client.write_all(b"AB").await.unwrap();

        let first = server.read_exact_bytes(1).await.unwrap();
        assert_eq!(first, b"A");

        let mut out = [0u8; 1];
        let n = AsyncReadExt::read(&mut server, &mut out).await.unwrap();
        assert_eq!(n, 1);
        assert_eq!(&out, b"B");
    }
}
