use crate::error::SessionError;
use std::fmt::Debug;
use std::time::Duration;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter,
    ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;

/// Object-safe bundle of the stream traits the sessions need, so a
/// plain TCP connection and a TLS connection (including one upgraded
/// mid-session by STARTTLS) look the same to the protocol code.
pub trait AsyncReadAndWrite: AsyncRead + AsyncWrite + Debug + Unpin + Send {}

impl AsyncReadAndWrite for TcpStream {}
impl AsyncReadAndWrite for TlsStream<TcpStream> {}
impl AsyncReadAndWrite for TlsStream<BoxedAsyncReadAndWrite> {}

pub type BoxedAsyncReadAndWrite = Box<dyn AsyncReadAndWrite>;

pub const DEFAULT_MAX_LINE: usize = 65536;

/// CRLF line codec shared by all three protocols. Reads are bounded
/// by `max_line` and by the configured idle timeout; writes are
/// buffered and flushed at the end of each response group.
pub struct LineCodec {
    reader: BufReader<ReadHalf<BoxedAsyncReadAndWrite>>,
    writer: BufWriter<WriteHalf<BoxedAsyncReadAndWrite>>,
    max_line: usize,
    read_timeout: Option<Duration>,
}

impl LineCodec {
    pub fn new(
        stream: BoxedAsyncReadAndWrite,
        max_line: usize,
        read_timeout: Option<Duration>,
    ) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read),
            writer: BufWriter::new(write),
            max_line,
            read_timeout,
        }
    }

    /// Change the read idle timeout; IMAP IDLE disables it for the
    /// duration of the idle.
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    /// Recover the underlying stream, e.g. to hand it to a TLS
    /// acceptor during STARTTLS. Any unread buffered input is
    /// dropped; the protocols forbid pipelining across the upgrade.
    pub fn into_stream(self) -> BoxedAsyncReadAndWrite {
        let read = self.reader.into_inner();
        let write = self.writer.into_inner();
        read.unsplit(write)
    }

    async fn read_line_inner(&mut self) -> Result<Option<Vec<u8>>, SessionError> {
        let mut buf = Vec::new();
        let mut taken = (&mut self.reader).take(self.max_line as u64 + 1);
        let n = taken.read_until(b'\n', &mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        if buf.len() > self.max_line {
            return Err(SessionError::Protocol("line too long".to_string()));
        }
        if buf.last() != Some(&b'\n') {
            return Err(SessionError::Protocol(
                "connection closed mid-line".to_string(),
            ));
        }
        while matches!(buf.last(), Some(b'\r' | b'\n')) {
            buf.pop();
        }
        Ok(Some(buf))
    }

    /// Read one raw line, without its line ending. `Ok(None)` is a
    /// clean EOF at a line boundary. Used where payloads must stay
    /// 8-bit transparent (SMTP DATA).
    pub async fn read_line_bytes(&mut self) -> Result<Option<Vec<u8>>, SessionError> {
        match self.read_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.read_line_inner())
                .await
                .map_err(|_| {
                    SessionError::Protocol("connection idle timeout exceeded".to_string())
                })?,
            None => self.read_line_inner().await,
        }
    }

    /// Read one command line as text. Command grammar is ASCII; any
    /// 8-bit payload arrives via literals or DATA, not here.
    pub async fn read_line(&mut self) -> Result<Option<String>, SessionError> {
        Ok(self
            .read_line_bytes()
            .await?
            .map(|buf| String::from_utf8_lossy(&buf).into_owned()))
    }

    /// Read exactly `count` raw octets (IMAP literal payloads).
    pub async fn read_exact(&mut self, count: usize) -> Result<Vec<u8>, SessionError> {
        let mut buf = vec![0u8; count];
        self.reader
            .read_exact(&mut buf)
            .await
            .map_err(|_| SessionError::ConnectionClosed)?;
        Ok(buf)
    }

    pub async fn write_line(&mut self, line: &str) -> Result<(), SessionError> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        Ok(())
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
        self.writer.write_all(bytes).await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), SessionError> {
        self.writer.flush().await?;
        Ok(())
    }
}
