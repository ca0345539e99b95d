//! Wire codec for the object-daemon socket.
//!
//! Values on the wire are variable-length integers and length-prefixed byte
//! strings; nothing is self-describing, so the caller must know the expected
//! shape from the opcode being exchanged.
//!
//! # Wire format
//!
//! ```text
//! uint:  little-endian base-128 groups, continuation bit set on every
//!        byte but the last
//! int:   zig-zag mapped onto the uint encoding
//! data:  uint length prefix followed by that many raw bytes
//! fixed: raw bytes, length known from protocol context (e.g. a 20-byte
//!        object id)
//! ```
//!
//! # End-of-stream vs. truncation
//!
//! End-of-stream at a value boundary ([`WireError::Eof`]) is a distinct,
//! non-fatal condition: the object-daemon client uses it to detect the end
//! of a repeated-record response such as a commit list. Running out of
//! bytes in the middle of a value ([`WireError::Truncated`]) is always a
//! fatal protocol error.
//!
//! # Security considerations
//!
//! - Length prefixes are validated against a cap before allocation.
//! - An unsigned integer longer than [`MAX_UINT_BYTES`] encoded bytes is
//!   rejected; a conforming peer never needs more than ten.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum encoded length of a single unsigned integer in bytes.
///
/// Ten base-128 groups cover every 64-bit value; an eleventh byte means the
/// peer is not speaking this protocol.
pub const MAX_UINT_BYTES: usize = 10;

/// Default cap on the length prefix of a `data` value (64 MiB).
///
/// Blob contents travel through `data` values, so the cap is generous, but
/// it is still checked before any allocation happens.
pub const MAX_DATA_LEN: usize = 64 * 1024 * 1024;

/// Errors produced by the wire codec.
#[derive(Debug, Error)]
pub enum WireError {
    /// The stream ended cleanly at a value boundary.
    ///
    /// Not a protocol violation; repeated-record responses are terminated
    /// this way.
    #[error("end of stream")]
    Eof,

    /// The stream ended in the middle of a value.
    #[error("truncated value: {context}")]
    Truncated {
        /// What was being decoded when the stream ran out.
        context: &'static str,
    },

    /// An unsigned integer did not terminate within [`MAX_UINT_BYTES`].
    #[error("unsigned integer overflows 64 bits")]
    IntOverflow,

    /// A length prefix exceeded the configured cap.
    ///
    /// Detected before allocation.
    #[error("data length {len} exceeds maximum {max}")]
    Oversize {
        /// Length announced by the peer.
        len: u64,
        /// Configured cap.
        max: usize,
    },

    /// Underlying transport failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl WireError {
    /// Returns `true` for the clean end-of-stream condition.
    #[must_use]
    pub const fn is_eof(&self) -> bool {
        matches!(self, Self::Eof)
    }
}

/// Result type for wire operations.
pub type WireResult<T> = Result<T, WireError>;

fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

/// Writer half of the codec.
///
/// Writes are buffered by whatever `W` the caller supplies; the caller is
/// responsible for flushing before expecting a response.
pub struct WireWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> WireWriter<W> {
    /// Wraps a writer.
    pub const fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Consumes the wrapper, returning the underlying writer.
    pub fn into_inner(self) -> W {
        self.inner
    }

    /// Writes an unsigned integer.
    pub async fn write_uint(&mut self, mut value: u64) -> WireResult<()> {
        let mut buf = [0u8; MAX_UINT_BYTES];
        let mut n = 0;
        while value >= 0x80 {
            buf[n] = (value as u8) | 0x80;
            value >>= 7;
            n += 1;
        }
        buf[n] = value as u8;
        self.inner.write_all(&buf[..=n]).await?;
        Ok(())
    }

    /// Writes a signed integer using the zig-zag mapping.
    pub async fn write_int(&mut self, value: i64) -> WireResult<()> {
        self.write_uint(zigzag_encode(value)).await
    }

    /// Writes a length-prefixed byte string.
    pub async fn write_data(&mut self, data: &[u8]) -> WireResult<()> {
        self.write_uint(data.len() as u64).await?;
        self.inner.write_all(data).await?;
        Ok(())
    }

    /// Writes raw bytes with no length prefix.
    pub async fn write_fixed(&mut self, data: &[u8]) -> WireResult<()> {
        self.inner.write_all(data).await?;
        Ok(())
    }

    /// Flushes the underlying writer.
    pub async fn flush(&mut self) -> WireResult<()> {
        self.inner.flush().await?;
        Ok(())
    }
}

/// Reader half of the codec.
pub struct WireReader<R> {
    inner: R,
    max_data_len: usize,
}

impl<R: AsyncRead + Unpin> WireReader<R> {
    /// Wraps a reader with the default data-length cap.
    pub const fn new(inner: R) -> Self {
        Self {
            inner,
            max_data_len: MAX_DATA_LEN,
        }
    }

    /// Overrides the data-length cap.
    #[must_use]
    pub const fn with_max_data_len(mut self, max: usize) -> Self {
        self.max_data_len = max;
        self
    }

    /// Reads one byte, mapping end-of-stream according to position.
    async fn read_byte(&mut self, first: bool, context: &'static str) -> WireResult<u8> {
        match self.inner.read_u8().await {
            Ok(b) => Ok(b),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                if first {
                    Err(WireError::Eof)
                } else {
                    Err(WireError::Truncated { context })
                }
            }
            Err(e) => Err(WireError::Io(e)),
        }
    }

    /// Reads an unsigned integer.
    ///
    /// # Errors
    ///
    /// [`WireError::Eof`] if the stream ended before the first byte;
    /// [`WireError::Truncated`] if it ended between bytes of one value.
    pub async fn read_uint(&mut self) -> WireResult<u64> {
        let mut value: u64 = 0;
        let mut shift = 0u32;
        for i in 0..MAX_UINT_BYTES {
            let byte = self.read_byte(i == 0, "unsigned integer").await?;
            let group = u64::from(byte & 0x7f);
            // The tenth byte may only carry the final bit of a 64-bit value.
            if shift == 63 && group > 1 {
                return Err(WireError::IntOverflow);
            }
            value |= group << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
        Err(WireError::IntOverflow)
    }

    /// Reads a signed integer.
    pub async fn read_int(&mut self) -> WireResult<i64> {
        Ok(zigzag_decode(self.read_uint().await?))
    }

    /// Reads a length-prefixed byte string.
    ///
    /// # Errors
    ///
    /// [`WireError::Eof`] only when the stream ends before the length
    /// prefix; a short payload is [`WireError::Truncated`]. A prefix above
    /// the cap is [`WireError::Oversize`] and nothing is allocated.
    pub async fn read_data(&mut self) -> WireResult<Vec<u8>> {
        let len = self.read_uint().await?;
        if len > self.max_data_len as u64 {
            return Err(WireError::Oversize {
                len,
                max: self.max_data_len,
            });
        }
        let mut buf = vec![0u8; len as usize];
        self.read_exact_into(&mut buf, "byte string").await?;
        Ok(buf)
    }

    /// Reads exactly `buf.len()` raw bytes with no length prefix.
    pub async fn read_fixed(&mut self, buf: &mut [u8]) -> WireResult<()> {
        self.read_exact_into(buf, "fixed-length value").await
    }

    async fn read_exact_into(&mut self, buf: &mut [u8], context: &'static str) -> WireResult<()> {
        match self.inner.read_exact(buf).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(WireError::Truncated { context })
            }
            Err(e) => Err(WireError::Io(e)),
        }
    }
}
