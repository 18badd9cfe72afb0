//! Framing codec for the sidecar protocols
//!
//! Handles varint encoding and both length-prefixed framings. Reads are exact:
//! the length prefix is consumed first, checked against the caller's bound,
//! and only then is the payload read. Nothing past the declared frame is ever
//! pulled from the stream.

use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Longest possible varint encoding of a u64
pub const MAX_VARINT_LEN: usize = 10;

/// Size of the fixed32 length prefix
pub const FIXED32_PREFIX_LEN: usize = 4;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Varint overflow: encoding exceeds {0} bytes")]
    VarintOverflow(usize),

    #[error("Malformed varint length prefix")]
    MalformedVarint,

    #[error("Frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(u64, usize),

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Connection closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Length prefix flavour of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Base-128 varint length prefix
    Varint,
    /// 4-byte little-endian length prefix
    Fixed32,
}

impl Framing {
    pub fn name(self) -> &'static str {
        match self {
            Framing::Varint => "varint",
            Framing::Fixed32 => "fixed32",
        }
    }

    /// Append a complete frame (prefix + payload) to `buf`
    pub fn encode(self, payload: &[u8], buf: &mut BytesMut) -> CodecResult<()> {
        match self {
            Framing::Varint => encode_frame_varint(payload, buf),
            Framing::Fixed32 => encode_frame_fixed32(payload, buf),
        }
    }

    /// Read exactly one frame from `reader`
    pub async fn read_frame<R>(self, reader: &mut R, max_len: usize) -> CodecResult<Bytes>
    where
        R: AsyncRead + Unpin,
    {
        match self {
            Framing::Varint => read_frame_varint(reader, max_len).await,
            Framing::Fixed32 => read_frame_fixed32(reader, max_len).await,
        }
    }

    /// Write exactly one frame to `writer`
    pub async fn write_frame<W>(self, writer: &mut W, payload: &[u8]) -> CodecResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = BytesMut::with_capacity(MAX_VARINT_LEN + payload.len());
        self.encode(payload, &mut buf)?;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Number of bytes `value` occupies as a varint
pub fn varint_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.max(1).div_ceil(7)
}

/// Encode `value` as a varint, appending it to `buf`
///
/// Returns the number of bytes written.
pub fn encode_varint(value: u64, buf: &mut impl BufMut) -> CodecResult<usize> {
    let mut scratch = [0u8; MAX_VARINT_LEN];
    let mut remaining = value;
    let mut n = 0;

    loop {
        if n >= MAX_VARINT_LEN {
            return Err(CodecError::VarintOverflow(MAX_VARINT_LEN));
        }
        let mut byte = (remaining & 0x7F) as u8;
        remaining >>= 7;
        if remaining != 0 {
            byte |= 0x80;
        }
        scratch[n] = byte;
        n += 1;
        if remaining == 0 {
            break;
        }
    }

    if buf.remaining_mut() < n {
        return Err(CodecError::VarintOverflow(buf.remaining_mut()));
    }
    buf.put_slice(&scratch[..n]);
    Ok(n)
}

/// Fold one varint byte into `acc`. Returns true once the varint is complete.
fn accumulate_varint(acc: &mut u64, index: usize, byte: u8) -> CodecResult<bool> {
    let bits = (byte & 0x7F) as u64;
    // The tenth byte may only carry the top bit of a u64
    if index == MAX_VARINT_LEN - 1 && (byte & 0x80 != 0 || bits > 1) {
        return Err(CodecError::MalformedVarint);
    }
    *acc |= bits << (7 * index);
    Ok(byte & 0x80 == 0)
}

/// Decode a varint from the front of `buf`
///
/// Returns `Ok(None)` if `buf` ends before the varint does, otherwise the
/// value and the number of bytes consumed.
pub fn decode_varint(buf: &[u8]) -> CodecResult<Option<(u64, usize)>> {
    let mut value = 0u64;
    for (i, &byte) in buf.iter().take(MAX_VARINT_LEN).enumerate() {
        if accumulate_varint(&mut value, i, byte)? {
            return Ok(Some((value, i + 1)));
        }
    }
    Ok(None)
}

/// Read a varint from `reader` one byte at a time
pub async fn read_varint<R>(reader: &mut R) -> CodecResult<u64>
where
    R: AsyncRead + Unpin,
{
    let mut value = 0u64;
    for i in 0..MAX_VARINT_LEN {
        let byte = reader.read_u8().await.map_err(read_error)?;
        if accumulate_varint(&mut value, i, byte)? {
            return Ok(value);
        }
    }
    Err(CodecError::MalformedVarint)
}

fn read_error(e: io::Error) -> CodecError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        CodecError::Closed
    } else {
        CodecError::Io(e)
    }
}

/// Read a payload whose length has already been decoded
async fn read_payload<R>(reader: &mut R, len: u64, max_len: usize) -> CodecResult<Bytes>
where
    R: AsyncRead + Unpin,
{
    if len == 0 {
        return Ok(Bytes::new());
    }
    if len > max_len as u64 {
        return Err(CodecError::FrameTooLarge(len, max_len));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await.map_err(read_error)?;
    Ok(Bytes::from(payload))
}

pub fn encode_frame_varint(payload: &[u8], buf: &mut BytesMut) -> CodecResult<()> {
    buf.reserve(varint_len(payload.len() as u64) + payload.len());
    encode_varint(payload.len() as u64, buf)?;
    buf.put_slice(payload);
    Ok(())
}

pub fn encode_frame_fixed32(payload: &[u8], buf: &mut BytesMut) -> CodecResult<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| CodecError::FrameTooLarge(payload.len() as u64, u32::MAX as usize))?;
    buf.reserve(FIXED32_PREFIX_LEN + payload.len());
    buf.put_u32_le(len);
    buf.put_slice(payload);
    Ok(())
}

/// Read one varint-prefixed frame
pub async fn read_frame_varint<R>(reader: &mut R, max_len: usize) -> CodecResult<Bytes>
where
    R: AsyncRead + Unpin,
{
    let len = read_varint(reader).await?;
    read_payload(reader, len, max_len).await
}

/// Write one varint-prefixed frame
pub async fn write_frame_varint<W>(writer: &mut W, payload: &[u8]) -> CodecResult<()>
where
    W: AsyncWrite + Unpin,
{
    Framing::Varint.write_frame(writer, payload).await
}

/// Read one fixed32-prefixed frame
pub async fn read_frame_fixed32<R>(reader: &mut R, max_len: usize) -> CodecResult<Bytes>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32_le().await.map_err(read_error)?;
    read_payload(reader, len as u64, max_len).await
}

/// Write one fixed32-prefixed frame
pub async fn write_frame_fixed32<W>(writer: &mut W, payload: &[u8]) -> CodecResult<()>
where
    W: AsyncWrite + Unpin,
{
    Framing::Fixed32.write_frame(writer, payload).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn varint_bytes(value: u64) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_varint(value, &mut buf).unwrap();
        buf.to_vec()
    }

    #[test]
    fn test_varint_known_encodings() {
        assert_eq!(varint_bytes(0), vec![0x00]);
        assert_eq!(varint_bytes(1), vec![0x01]);
        assert_eq!(varint_bytes(127), vec![0x7F]);
        assert_eq!(varint_bytes(128), vec![0x80, 0x01]);
        assert_eq!(varint_bytes(300), vec![0xAC, 0x02]);
        assert_eq!(varint_bytes(50051), vec![0x83, 0x87, 0x03]);
        // Low group first: C3 86 03 is a different port
        assert_eq!(decode_varint(&[0xC3, 0x86, 0x03]).unwrap(), Some((49987, 3)));
    }

    #[test]
    fn test_varint_roundtrip() {
        let mut values = vec![0u64, 1, 13, 127, 128, 16_383, 16_384, u32::MAX as u64];
        values.extend((0..63).map(|shift| 1u64 << shift));
        values.push((1u64 << 63) - 1);

        for value in values {
            let bytes = varint_bytes(value);
            assert!(bytes.len() <= MAX_VARINT_LEN);
            assert_eq!(bytes.len(), varint_len(value));
            assert_eq!(decode_varint(&bytes).unwrap(), Some((value, bytes.len())));
        }
    }

    #[test]
    fn test_varint_u64_max_is_ten_bytes() {
        let bytes = varint_bytes(u64::MAX);
        assert_eq!(bytes.len(), MAX_VARINT_LEN);
        assert_eq!(decode_varint(&bytes).unwrap(), Some((u64::MAX, MAX_VARINT_LEN)));
    }

    #[test]
    fn test_varint_bounded_destination() {
        let mut storage = [0u8; 2];
        let mut dst = &mut storage[..];
        assert!(matches!(
            encode_varint(50051, &mut dst),
            Err(CodecError::VarintOverflow(2))
        ));
    }

    #[test]
    fn test_decode_varint_incomplete_and_malformed() {
        assert_eq!(decode_varint(&[0x80, 0x80]).unwrap(), None);
        assert!(matches!(
            decode_varint(&[0xFF; 11]),
            Err(CodecError::MalformedVarint)
        ));
    }

    #[tokio::test]
    async fn test_read_frame_varint() {
        let mut src: &[u8] = &[0x02, 0x08, 0x01, 0xEE];
        let payload = read_frame_varint(&mut src, 64).await.unwrap();
        assert_eq!(&payload[..], &[0x08, 0x01]);
        assert_eq!(src, &[0xEE]);
    }

    #[tokio::test]
    async fn test_read_empty_frame_reads_no_body() {
        let mut src: &[u8] = &[0x00, 0xAA];
        let payload = read_frame_varint(&mut src, 64).await.unwrap();
        assert!(payload.is_empty());
        assert_eq!(src, &[0xAA]);

        let mut src: &[u8] = &[0x00, 0x00, 0x00, 0x00, 0xAA];
        let payload = read_frame_fixed32(&mut src, 64).await.unwrap();
        assert!(payload.is_empty());
        assert_eq!(src, &[0xAA]);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_before_payload() {
        let mut src: &[u8] = &[0x05, 1, 2, 3, 4, 5];
        let err = read_frame_varint(&mut src, 4).await.unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge(5, 4)));
        assert_eq!(src.len(), 5);

        let mut src: &[u8] = &[0x01, 0x01, 0x00, 0x00, 0xAB];
        let err = read_frame_fixed32(&mut src, 256).await.unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge(257, 256)));
        assert_eq!(src, &[0xAB]);
    }

    #[tokio::test]
    async fn test_frame_at_bound_is_accepted() {
        let mut src: &[u8] = &[0x04, 1, 2, 3, 4];
        let payload = read_frame_varint(&mut src, 4).await.unwrap();
        assert_eq!(payload.len(), 4);
    }

    #[tokio::test]
    async fn test_eof_is_closed() {
        let mut src: &[u8] = &[];
        assert!(matches!(
            read_frame_varint(&mut src, 64).await,
            Err(CodecError::Closed)
        ));

        let mut src: &[u8] = &[0x03, 0x08];
        assert!(matches!(
            read_frame_varint(&mut src, 64).await,
            Err(CodecError::Closed)
        ));

        let mut src: &[u8] = &[0x02, 0x00];
        assert!(matches!(
            read_frame_fixed32(&mut src, 64).await,
            Err(CodecError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_write_frames_exact_bytes() {
        let mut mock = tokio_test::io::Builder::new()
            .write(&[0x02, 0x08, 0x01])
            .build();
        write_frame_varint(&mut mock, &[0x08, 0x01]).await.unwrap();

        let mut mock = tokio_test::io::Builder::new()
            .write(&[0x02, 0x00, 0x00, 0x00, 0x08, 0x0D])
            .build();
        write_frame_fixed32(&mut mock, &[0x08, 0x0D]).await.unwrap();
    }

    #[tokio::test]
    async fn test_frame_roundtrip_both_framings() {
        let max_len = 300;
        for framing in [Framing::Varint, Framing::Fixed32] {
            for len in [0usize, 1, 2, 127, 128, 299, 300] {
                let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
                let (mut client, mut server) = tokio::io::duplex(4096);

                framing.write_frame(&mut client, &payload).await.unwrap();
                let read = framing.read_frame(&mut server, max_len).await.unwrap();
                assert_eq!(&read[..], &payload[..], "{} len {}", framing.name(), len);
            }
        }
    }
}
