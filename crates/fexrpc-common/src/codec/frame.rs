use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tracing::debug;

use super::CodecKind;
use crate::protocol::{Header, Result, RpcError};

/// Upper bound on a single frame, against hostile length prefixes.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Read half of a codec: decodes headers and returns raw body payloads.
pub struct FrameReader<R> {
    reader: BufReader<R>,
    kind: CodecKind,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, kind: CodecKind) -> Self {
        FrameReader {
            reader: BufReader::new(reader),
            kind,
        }
    }

    /// Wraps an already-buffered reader, keeping any bytes it holds.
    ///
    /// Used when the connection handshake read through the same buffer:
    /// frame data that arrived with the tail of the handshake must not be
    /// lost.
    pub fn from_buffered(reader: BufReader<R>, kind: CodecKind) -> Self {
        FrameReader { reader, kind }
    }

    pub fn kind(&self) -> CodecKind {
        self.kind
    }

    /// Reads and decodes one header frame.
    ///
    /// Returns `Ok(None)` on clean EOF at a frame boundary. EOF inside a
    /// frame and undecodable header payloads are errors: the stream can no
    /// longer be trusted.
    pub async fn read_header(&mut self) -> Result<Option<Header>> {
        let payload = match self.read_frame().await {
            Ok(payload) => payload,
            Err(FrameError::Eof) => return Ok(None),
            Err(FrameError::Failed(err)) => return Err(err),
        };
        let header = self.kind.from_slice(&payload)?;
        Ok(Some(header))
    }

    /// Reads one body frame and returns its raw payload.
    ///
    /// Discarding a body is simply dropping the returned buffer; the frame
    /// is consumed either way, so the stream stays aligned.
    pub async fn read_body(&mut self) -> Result<Vec<u8>> {
        match self.read_frame().await {
            Ok(payload) => Ok(payload),
            Err(FrameError::Eof) => Err(RpcError::Protocol(
                "unexpected eof before body frame".to_string(),
            )),
            Err(FrameError::Failed(err)) => Err(err),
        }
    }

    async fn read_frame(&mut self) -> std::result::Result<Vec<u8>, FrameError> {
        let mut len_buf = [0u8; 4];
        match self.reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(FrameError::Eof);
            }
            Err(err) => return Err(FrameError::Failed(err.into())),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(FrameError::Failed(RpcError::Protocol(format!(
                "frame too large: {len} bytes (max {MAX_FRAME_SIZE})"
            ))));
        }
        let mut payload = vec![0u8; len];
        match self.reader.read_exact(&mut payload).await {
            Ok(_) => Ok(payload),
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Err(FrameError::Failed(
                RpcError::Protocol("unexpected eof inside frame".to_string()),
            )),
            Err(err) => Err(FrameError::Failed(err.into())),
        }
    }
}

enum FrameError {
    /// Clean EOF at a frame boundary.
    Eof,
    Failed(RpcError),
}

/// Write half of a codec: emits `(Header, Body)` pairs atomically.
pub struct FrameWriter<W> {
    writer: BufWriter<W>,
    kind: CodecKind,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W, kind: CodecKind) -> Self {
        FrameWriter {
            writer: BufWriter::new(writer),
            kind,
        }
    }

    pub fn kind(&self) -> CodecKind {
        self.kind
    }

    /// Writes one header frame and one body frame, then flushes.
    ///
    /// On failure the write half is shut down so every later write fails
    /// fast instead of emitting a torn frame.
    pub async fn write(&mut self, header: &Header, body: &[u8]) -> Result<()> {
        match self.write_frames(header, body).await {
            Ok(()) => Ok(()),
            Err(err) => {
                debug!(error = %err, "codec write failed, shutting down write half");
                let _ = self.writer.shutdown().await;
                Err(err)
            }
        }
    }

    async fn write_frames(&mut self, header: &Header, body: &[u8]) -> Result<()> {
        let header_bytes = self.kind.to_vec(header)?;
        self.writer
            .write_all(&(header_bytes.len() as u32).to_be_bytes())
            .await?;
        self.writer.write_all(&header_bytes).await?;
        self.writer
            .write_all(&(body.len() as u32).to_be_bytes())
            .await?;
        self.writer.write_all(body).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Closes the write half, signalling EOF to the peer.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
