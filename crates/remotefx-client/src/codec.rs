//! Message codec
//!
//! Framing is `[u32 length (big-endian)][payload]` on all three channels.
//! Command payloads are JSON documents; audio and screen payloads start with a
//! fixed-int bincode header followed by raw sample or pixel bytes.

use crate::audio::Sample;
use crate::error::{ClientError, Result};
use crate::protocol::{AudioFrameHeader, ScreenFrameHeader};
use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Cursor;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const LENGTH_PREFIX: usize = 4;

/// Upper bound for a binary header (MIDI batch included).
const MAX_HEADER_SIZE: u64 = 64 * 1024;

const READ_CHUNK: usize = 16 * 1024;

fn header_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_HEADER_SIZE)
}

/// Prefixes `payload` with its length.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(LENGTH_PREFIX + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Writes one frame with a single `write_all`.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    writer.write_all(&frame(payload)).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn write_json<W: AsyncWrite + Unpin, T: Serialize>(writer: &mut W, msg: &T) -> Result<()> {
    write_frame(writer, &encode_json(msg)?).await
}

/// Frame reader that keeps partially received bytes between calls.
///
/// `next_frame` is cancel safe: dropping the future mid-frame loses nothing,
/// and the next call resumes where the previous one stopped.
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
    max_frame_size: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_frame_size: usize) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(READ_CHUNK),
            max_frame_size,
        }
    }

    /// Bytes received but not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    pub async fn next_frame(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some(frame) = self.take_frame()? {
                return Ok(frame);
            }
            self.buf.reserve(READ_CHUNK);
            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(if self.buf.is_empty() {
                    ClientError::ConnectionFailed("connection closed by peer".to_string())
                } else {
                    ClientError::Protocol(format!(
                        "connection closed with {} bytes of a partial frame",
                        self.buf.len()
                    ))
                });
            }
        }
    }

    pub async fn next_json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let frame = self.next_frame().await?;
        decode_json(&frame)
    }

    fn take_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if self.buf.len() < LENGTH_PREFIX {
            return Ok(None);
        }
        let mut len_bytes = [0u8; LENGTH_PREFIX];
        len_bytes.copy_from_slice(&self.buf[..LENGTH_PREFIX]);
        let len = u32::from_be_bytes(len_bytes) as usize;

        if len == 0 || len > self.max_frame_size {
            return Err(ClientError::Protocol(format!(
                "bad frame length {} (max {})",
                len, self.max_frame_size
            )));
        }
        if self.buf.len() < LENGTH_PREFIX + len {
            return Ok(None);
        }

        let frame = self.buf[LENGTH_PREFIX..LENGTH_PREFIX + len].to_vec();
        self.buf.drain(..LENGTH_PREFIX + len);
        Ok(Some(frame))
    }
}

pub fn encode_json<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(msg)?)
}

/// Decodes a JSON payload; malformed documents become protocol errors.
pub fn decode_json<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload)
        .map_err(|e| ClientError::Protocol(format!("malformed payload: {}", e)))
}

/// Encodes one audio frame from planar channel slices into `out` (cleared first).
pub fn encode_audio<T: Sample, C: AsRef<[T]>>(
    header: &AudioFrameHeader,
    channels: &[C],
    out: &mut Vec<u8>,
) -> Result<()> {
    out.clear();
    header_options().serialize_into(&mut *out, header)?;
    let samples = header.samples as usize;
    for ch in channels.iter().take(header.channels as usize) {
        for &s in ch.as_ref().iter().take(samples) {
            s.extend_le(out);
        }
    }
    Ok(())
}

/// Splits an audio payload into its header and raw sample bytes.
pub fn decode_audio(payload: &[u8]) -> Result<(AudioFrameHeader, &[u8])> {
    let mut cursor = Cursor::new(payload);
    let header: AudioFrameHeader = header_options().deserialize_from(&mut cursor)?;
    let body = &payload[cursor.position() as usize..];
    if body.len() != header.payload_len() {
        return Err(ClientError::Protocol(format!(
            "audio frame {}: expected {} sample bytes, got {}",
            header.seq,
            header.payload_len(),
            body.len()
        )));
    }
    Ok((header, body))
}

/// Reads channel `ch` of a decoded audio body into `dest`. Returns samples written.
pub fn read_channel<T: Sample>(header: &AudioFrameHeader, body: &[u8], ch: usize, dest: &mut [T]) -> usize {
    if ch >= header.channels as usize {
        return 0;
    }
    let size = header.precision.sample_size();
    let samples = header.samples as usize;
    let start = ch * samples * size;
    let n = samples.min(dest.len());
    for (i, bytes) in body[start..start + n * size].chunks_exact(size).enumerate() {
        dest[i] = T::from_le(bytes);
    }
    n
}

pub fn encode_screen(header: &ScreenFrameHeader, pixels: &[u8]) -> Result<Vec<u8>> {
    let mut out = header_options().serialize(header)?;
    out.extend_from_slice(pixels);
    Ok(out)
}

/// Splits a screen payload into its header and the dirty-rectangle pixels.
///
/// The full image the header declares must fit in `max_image_size` bytes.
pub fn decode_screen(payload: &[u8], max_image_size: usize) -> Result<(ScreenFrameHeader, &[u8])> {
    let mut cursor = Cursor::new(payload);
    let header: ScreenFrameHeader = header_options().deserialize_from(&mut cursor)?;
    match header.image_len() {
        Some(len) if len <= max_image_size => {}
        _ => {
            return Err(ClientError::Protocol(format!(
                "screen image {}x{} exceeds {} bytes",
                header.width, header.height, max_image_size
            )));
        }
    }
    if !header.fits() {
        return Err(ClientError::Protocol(format!(
            "screen rect {}x{}+{}+{} outside {}x{}",
            header.w, header.h, header.x, header.y, header.width, header.height
        )));
    }
    let body = &payload[cursor.position() as usize..];
    if body.len() != header.payload_len() {
        return Err(ClientError::Protocol(format!(
            "screen frame: expected {} pixel bytes, got {}",
            header.payload_len(),
            body.len()
        )));
    }
    Ok((header, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::protocol::{MidiEvent, Precision, Request, RequestEnvelope, TransportInfo};

    #[tokio::test]
    async fn test_frame_reader_resumes_partial_reads() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(rx, 1024);

        let bytes = frame(b"{\"seq\":1,\"type\":\"CpuLoad\"}");
        tx.write_all(&bytes[..6]).await.unwrap();

        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            reader.next_frame(),
        )
        .await;
        assert!(pending.is_err());
        assert_eq!(reader.buffered(), 6);

        tx.write_all(&bytes[6..]).await.unwrap();
        let env: RequestEnvelope = decode_json(&reader.next_frame().await.unwrap()).unwrap();
        assert_eq!(env.seq, 1);
        assert_eq!(env.request, Request::CpuLoad);
    }

    #[tokio::test]
    async fn test_frame_reader_rejects_bad_length() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(rx, 16);
        tx.write_all(&1000u32.to_be_bytes()).await.unwrap();
        let err = reader.next_frame().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[tokio::test]
    async fn test_frame_reader_truncated_frame() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(rx, 1024);
        tx.write_all(&frame(b"0123456789")[..8]).await.unwrap();
        drop(tx);
        let err = reader.next_frame().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[tokio::test]
    async fn test_frame_reader_clean_eof_is_connection_error() {
        let (tx, rx) = tokio::io::duplex(64);
        drop(tx);
        let mut reader = FrameReader::new(rx, 1024);
        let err = reader.next_frame().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
    }

    #[test]
    fn test_decode_json_malformed_is_protocol_error() {
        let err = decode_json::<RequestEnvelope>(b"{\"seq\":1,\"type\":\"Nope\"}").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        let err = decode_json::<RequestEnvelope>(b"not json").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_audio_frame_layout() {
        let mut header = AudioFrameHeader {
            seq: 9,
            precision: Precision::Single,
            channels: 2,
            samples: 4,
            transport: TransportInfo {
                playing: true,
                tempo: 98.5,
                ..Default::default()
            },
            ..Default::default()
        };
        header.midi.push(MidiEvent::note_on(2, 0, 64, 90));

        let left = [0.1f32, 0.2, 0.3, 0.4];
        let right = [-0.1f32, -0.2, -0.3, -0.4];
        let mut payload = Vec::new();
        encode_audio(&header, &[&left[..], &right[..]], &mut payload).unwrap();

        let (decoded, body) = decode_audio(&payload).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(body.len(), 2 * 4 * 4);

        let mut out = [0f32; 4];
        assert_eq!(read_channel(&decoded, body, 1, &mut out), 4);
        assert_eq!(out, right);
        assert_eq!(read_channel(&decoded, body, 2, &mut out), 0);
    }

    #[test]
    fn test_audio_frame_truncated_body() {
        let header = AudioFrameHeader {
            precision: Precision::Double,
            channels: 1,
            samples: 8,
            ..Default::default()
        };
        let mut payload = Vec::new();
        encode_audio(&header, &[vec![0f64; 8]], &mut payload).unwrap();
        payload.truncate(payload.len() - 3);
        assert_eq!(decode_audio(&payload).unwrap_err().kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_screen_frame_validation() {
        let header = ScreenFrameHeader {
            width: 4,
            height: 4,
            x: 1,
            y: 1,
            w: 2,
            h: 2,
        };
        let payload = encode_screen(&header, &[7u8; 16]).unwrap();
        let (decoded, pixels) = decode_screen(&payload, 1 << 20).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(pixels.len(), 16);

        let payload = encode_screen(&header, &[7u8; 15]).unwrap();
        assert_eq!(decode_screen(&payload, 1 << 20).unwrap_err().kind(), ErrorKind::Protocol);

        let bad = ScreenFrameHeader { x: 3, ..header };
        let payload = encode_screen(&bad, &[7u8; 16]).unwrap();
        assert_eq!(decode_screen(&payload, 1 << 20).unwrap_err().kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_screen_frame_rejects_oversized_image() {
        // A one-pixel update into an image no client could allocate.
        let overflow = ScreenFrameHeader {
            width: u32::MAX,
            height: u32::MAX,
            x: 0,
            y: 0,
            w: 1,
            h: 1,
        };
        let payload = encode_screen(&overflow, &[7u8; 4]).unwrap();
        assert_eq!(decode_screen(&payload, 1 << 20).unwrap_err().kind(), ErrorKind::Protocol);

        let large = ScreenFrameHeader {
            width: 1024,
            height: 1024,
            ..overflow
        };
        let payload = encode_screen(&large, &[7u8; 4]).unwrap();
        assert_eq!(decode_screen(&payload, 1 << 20).unwrap_err().kind(), ErrorKind::Protocol);
        assert!(decode_screen(&payload, 4 << 20).is_ok());
    }
}
