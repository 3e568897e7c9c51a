use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::error::{Result, RpcError};
use crate::codec::CodecKind;

/// Fixed constant identifying the fexrpc handshake envelope.
pub const MAGIC_NUMBER: u32 = 0x3bef5c;

/// Default connect timeout. Zero means no limit.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Size of the fixed-width binary `Opt` envelope:
/// `magic: u32 | codec: u8 | connect_timeout_ms: u64 | handle_timeout_ms: u64`,
/// all big-endian.
const BINARY_OPT_LEN: usize = 4 + 1 + 8 + 8;

/// Handshake record sent first on every connection.
///
/// `Opt` negotiates the codec for all subsequent frames and the two timeout
/// budgets. Its own encoding is a system-wide deployment choice
/// ([`OptEncoding`]), distinct from the codec it selects; both ends must
/// agree on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Opt {
    pub magic: u32,
    pub codec: CodecKind,
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub handle_timeout: Duration,
}

impl Default for Opt {
    fn default() -> Self {
        Opt {
            magic: MAGIC_NUMBER,
            codec: CodecKind::Binary,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handle_timeout: Duration::ZERO,
        }
    }
}

impl Opt {
    pub fn with_codec(codec: CodecKind) -> Self {
        Opt {
            codec,
            ..Opt::default()
        }
    }

    /// Checks the magic number against [`MAGIC_NUMBER`].
    pub fn validate(&self) -> Result<()> {
        if self.magic != MAGIC_NUMBER {
            return Err(RpcError::Handshake(format!(
                "invalid magic number: {:#x}",
                self.magic
            )));
        }
        Ok(())
    }

    /// Writes the envelope in the given encoding and flushes.
    pub async fn write_to<W>(&self, writer: &mut W, encoding: OptEncoding) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        match encoding {
            OptEncoding::Binary => {
                let mut buf = [0u8; BINARY_OPT_LEN];
                buf[0..4].copy_from_slice(&self.magic.to_be_bytes());
                buf[4] = self.codec.wire_id();
                buf[5..13].copy_from_slice(&(self.connect_timeout.as_millis() as u64).to_be_bytes());
                buf[13..21].copy_from_slice(&(self.handle_timeout.as_millis() as u64).to_be_bytes());
                writer.write_all(&buf).await?;
            }
            OptEncoding::Json => {
                let mut line = serde_json::to_vec(self)?;
                line.push(b'\n');
                writer.write_all(&line).await?;
            }
        }
        writer.flush().await?;
        Ok(())
    }

    /// Reads one envelope in the given encoding.
    ///
    /// The JSON variant consumes exactly one newline-terminated line, so it
    /// never reads past the envelope into the frame stream.
    pub async fn read_from<R>(reader: &mut R, encoding: OptEncoding) -> Result<Opt>
    where
        R: AsyncBufRead + Unpin,
    {
        match encoding {
            OptEncoding::Binary => {
                let mut buf = [0u8; BINARY_OPT_LEN];
                reader.read_exact(&mut buf).await?;
                let magic = u32::from_be_bytes(buf[0..4].try_into().expect("4-byte slice"));
                let codec = CodecKind::from_wire(buf[4]).ok_or_else(|| {
                    RpcError::Handshake(format!("invalid codec type: {}", buf[4]))
                })?;
                let connect_ms = u64::from_be_bytes(buf[5..13].try_into().expect("8-byte slice"));
                let handle_ms = u64::from_be_bytes(buf[13..21].try_into().expect("8-byte slice"));
                Ok(Opt {
                    magic,
                    codec,
                    connect_timeout: Duration::from_millis(connect_ms),
                    handle_timeout: Duration::from_millis(handle_ms),
                })
            }
            OptEncoding::Json => {
                let mut line = String::new();
                let n = reader.read_line(&mut line).await?;
                if n == 0 {
                    return Err(RpcError::Handshake("eof before option record".to_string()));
                }
                Ok(serde_json::from_str(&line)?)
            }
        }
    }
}

/// System-wide encoding of the [`Opt`] envelope itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OptEncoding {
    /// Fixed-width big-endian record.
    #[default]
    Binary,
    /// One newline-terminated JSON document.
    Json,
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn encode(opt: Opt, encoding: OptEncoding) -> Vec<u8> {
        let mut buf = std::io::Cursor::new(Vec::new());
        opt.write_to(&mut buf, encoding).await.unwrap();
        buf.into_inner()
    }

    async fn round_trip(opt: Opt, encoding: OptEncoding) -> Opt {
        let buf = encode(opt, encoding).await;
        let mut reader = &buf[..];
        Opt::read_from(&mut reader, encoding).await.unwrap()
    }

    #[tokio::test]
    async fn binary_round_trip() {
        let opt = Opt {
            magic: MAGIC_NUMBER,
            codec: CodecKind::Json,
            connect_timeout: Duration::from_secs(3),
            handle_timeout: Duration::from_millis(1500),
        };
        assert_eq!(round_trip(opt, OptEncoding::Binary).await, opt);
    }

    #[tokio::test]
    async fn json_round_trip() {
        let opt = Opt::default();
        assert_eq!(round_trip(opt, OptEncoding::Json).await, opt);
    }

    #[tokio::test]
    async fn binary_envelope_is_fixed_width() {
        let buf = encode(Opt::default(), OptEncoding::Binary).await;
        assert_eq!(buf.len(), BINARY_OPT_LEN);
    }

    #[tokio::test]
    async fn json_envelope_stops_at_newline() {
        let mut buf = encode(Opt::default(), OptEncoding::Json).await;
        // Trailing frame data after the envelope must stay unread.
        buf.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        let mut reader = &buf[..];
        let opt = Opt::read_from(&mut reader, OptEncoding::Json).await.unwrap();
        assert_eq!(opt, Opt::default());
        assert_eq!(reader, &[0xde, 0xad, 0xbe, 0xef]);
    }

    #[tokio::test]
    async fn unknown_codec_id_is_a_handshake_error() {
        let mut buf = encode(Opt::default(), OptEncoding::Binary).await;
        buf[4] = 0x7f;
        let mut reader = &buf[..];
        let err = Opt::read_from(&mut reader, OptEncoding::Binary)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid codec type"));
    }

    #[test]
    fn bad_magic_fails_validation() {
        let opt = Opt {
            magic: 0x1234,
            ..Opt::default()
        };
        assert!(opt.validate().is_err());
        assert!(Opt::default().validate().is_ok());
    }
}
