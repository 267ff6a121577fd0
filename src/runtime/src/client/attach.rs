//! Attach stream framing.
//!
//! The task monitor multiplexes a container's stdio over a unix socket.
//! Every frame is `[kind: u8][len: u32 BE][payload]`:
//!
//! | kind | direction | payload |
//! |------|-----------|---------|
//! | 0 | client → monitor | stdin bytes |
//! | 1 | monitor → client | stdout bytes |
//! | 2 | monitor → client | stderr bytes |
//! | 3 | client → monitor | terminal size, rows u16 BE + cols u16 BE |
//! | 4 | client → monitor | close stdin |
//! | 5 | monitor → client | exit code, i32 BE |
//!
//! A client opens the connection with one hello byte: [`HELLO_ATTACH`] to
//! receive output (and optionally send input), [`HELLO_WAIT`] to receive only
//! the exit frame.

use std::pin::Pin;

use cdbox_core::error::{BoxError, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

pub const HELLO_ATTACH: u8 = b'a';
pub const HELLO_WAIT: u8 = b'w';

/// Largest payload accepted on the wire.
const MAX_FRAME: u32 = 1 << 20;

/// Bidirectional byte stream.
pub trait Duplex: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Duplex for T {}

/// One frame of the attach protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Stdin(Vec<u8>),
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Resize { rows: u16, cols: u16 },
    CloseStdin,
    Exit(i32),
}

impl Frame {
    fn kind(&self) -> u8 {
        match self {
            Frame::Stdin(_) => 0,
            Frame::Stdout(_) => 1,
            Frame::Stderr(_) => 2,
            Frame::Resize { .. } => 3,
            Frame::CloseStdin => 4,
            Frame::Exit(_) => 5,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            Frame::Stdin(b) | Frame::Stdout(b) | Frame::Stderr(b) => b.clone(),
            Frame::Resize { rows, cols } => {
                let mut out = rows.to_be_bytes().to_vec();
                out.extend_from_slice(&cols.to_be_bytes());
                out
            }
            Frame::CloseStdin => Vec::new(),
            Frame::Exit(code) => code.to_be_bytes().to_vec(),
        }
    }
}

/// Write one frame.
pub async fn write_frame<W: AsyncWrite + Unpin + ?Sized>(w: &mut W, frame: &Frame) -> Result<()> {
    let payload = frame.payload();
    let mut buf = Vec::with_capacity(5 + payload.len());
    buf.push(frame.kind());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

/// Read one frame; `Ok(None)` on a clean EOF between frames.
pub async fn read_frame<R: AsyncRead + Unpin + ?Sized>(r: &mut R) -> Result<Option<Frame>> {
    let mut header = [0u8; 5];
    match r.read_exact(&mut header[..1]).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    r.read_exact(&mut header[1..]).await?;
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    if len > MAX_FRAME {
        return Err(BoxError::runtime("attach", format!("frame too large: {len} bytes")));
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await?;

    let frame = match header[0] {
        0 => Frame::Stdin(payload),
        1 => Frame::Stdout(payload),
        2 => Frame::Stderr(payload),
        3 if payload.len() == 4 => Frame::Resize {
            rows: u16::from_be_bytes([payload[0], payload[1]]),
            cols: u16::from_be_bytes([payload[2], payload[3]]),
        },
        4 => Frame::CloseStdin,
        5 if payload.len() == 4 => {
            Frame::Exit(i32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]))
        }
        kind => {
            return Err(BoxError::runtime(
                "attach",
                format!("malformed frame kind {kind} ({len} bytes)"),
            ))
        }
    };
    Ok(Some(frame))
}

/// Client end of an attach connection.
pub struct AttachStream {
    inner: Pin<Box<dyn Duplex>>,
}

impl std::fmt::Debug for AttachStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachStream").finish_non_exhaustive()
    }
}

impl AttachStream {
    pub fn new(inner: Box<dyn Duplex>) -> Self {
        Self {
            inner: Box::into_pin(inner),
        }
    }

    pub async fn recv(&mut self) -> Result<Option<Frame>> {
        read_frame(&mut self.inner).await
    }

    pub async fn send(&mut self, frame: &Frame) -> Result<()> {
        write_frame(&mut self.inner, frame).await
    }

    /// Split into independently usable halves.
    pub fn split(self) -> (AttachReader, AttachWriter) {
        let (r, w) = tokio::io::split(self.inner);
        (AttachReader { inner: r }, AttachWriter { inner: w })
    }
}

pub struct AttachReader {
    inner: ReadHalf<Pin<Box<dyn Duplex>>>,
}

impl AttachReader {
    pub async fn recv(&mut self) -> Result<Option<Frame>> {
        read_frame(&mut self.inner).await
    }
}

pub struct AttachWriter {
    inner: WriteHalf<Pin<Box<dyn Duplex>>>,
}

impl AttachWriter {
    pub async fn send(&mut self, frame: &Frame) -> Result<()> {
        write_frame(&mut self.inner, frame).await
    }
}
