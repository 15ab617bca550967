//! Framed connection halves over TCP.

use bytes::{Buf, BytesMut};
use gantry_core::{GantryError, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::frame::{encode_frame, parse_frame, Frame};
use crate::protocol::HEADER_SIZE;

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug)]
pub struct FrameReader {
    half: OwnedReadHalf,
    buf: BytesMut,
}

impl FrameReader {
    /// Read the next frame. An EOF mid-stream surfaces as an I/O error;
    /// callers treat any failure as the connection being gone.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some((frame, consumed)) = parse_frame(&self.buf)? {
                self.buf.advance(consumed);
                return Ok(frame);
            }
            self.buf.reserve(READ_CHUNK.max(HEADER_SIZE));
            let n = self.half.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(GantryError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed",
                )));
            }
        }
    }
}

#[derive(Debug)]
pub struct FrameWriter {
    half: OwnedWriteHalf,
}

impl FrameWriter {
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let encoded = encode_frame(frame);
        self.half.write_all(&encoded).await?;
        Ok(())
    }

    /// Send a FIN; the peer's next read observes the close.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.half.shutdown().await?;
        Ok(())
    }
}

/// Split a stream into framed halves. Nagle is disabled: control-plane
/// frames are latency-sensitive and small.
pub fn split(stream: TcpStream) -> (FrameReader, FrameWriter) {
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    (
        FrameReader {
            half: read_half,
            buf: BytesMut::with_capacity(READ_CHUNK),
        },
        FrameWriter { half: write_half },
    )
}
