// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Wire frames carried by a multiplexed session
//!
//! Layout: `kind: u8`, `stream: u32`, `length: u32`, then `length` bytes of
//! payload. Integers are big-endian.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub type StreamId = u32;

pub const HEADER_LENGTH: usize = 9;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
  /// Announces a new logical stream
  Open = 0,
  Data = 1,
  /// Sender will write no more to the stream; it may still read
  Fin = 2,
  /// Abandons both directions of the stream
  Reset = 3,
  Ping = 4,
  Pong = 5,
  /// Grants the receiver of this frame credit to send more bytes on the stream
  Window = 6,
}

impl TryFrom<u8> for FrameKind {
  type Error = FrameReadError;

  fn try_from(value: u8) -> Result<Self, Self::Error> {
    Ok(match value {
      0 => Self::Open,
      1 => Self::Data,
      2 => Self::Fin,
      3 => Self::Reset,
      4 => Self::Ping,
      5 => Self::Pong,
      6 => Self::Window,
      unknown => return Err(FrameReadError::UnknownKind(unknown)),
    })
  }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
  pub kind: FrameKind,
  pub stream: StreamId,
  pub payload: Vec<u8>,
}

impl Frame {
  fn control(kind: FrameKind, stream: StreamId) -> Self {
    Self {
      kind,
      stream,
      payload: Vec::new(),
    }
  }

  pub fn open(stream: StreamId) -> Self {
    Self::control(FrameKind::Open, stream)
  }

  pub fn data(stream: StreamId, payload: Vec<u8>) -> Self {
    Self {
      kind: FrameKind::Data,
      stream,
      payload,
    }
  }

  pub fn fin(stream: StreamId) -> Self {
    Self::control(FrameKind::Fin, stream)
  }

  pub fn reset(stream: StreamId) -> Self {
    Self::control(FrameKind::Reset, stream)
  }

  pub fn ping() -> Self {
    Self::control(FrameKind::Ping, 0)
  }

  pub fn pong() -> Self {
    Self::control(FrameKind::Pong, 0)
  }

  pub fn window(stream: StreamId, credit: u32) -> Self {
    Self {
      kind: FrameKind::Window,
      stream,
      payload: credit.to_be_bytes().to_vec(),
    }
  }

  /// Credit carried by a [FrameKind::Window] frame; `None` if malformed
  pub fn credit(&self) -> Option<u32> {
    match (self.kind, <[u8; 4]>::try_from(self.payload.as_slice())) {
      (FrameKind::Window, Ok(bytes)) => Some(u32::from_be_bytes(bytes)),
      _ => None,
    }
  }
}

impl std::fmt::Debug for Frame {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Frame")
      .field("kind", &self.kind)
      .field("stream", &self.stream)
      .field("length", &self.payload.len())
      .finish()
  }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum NextExpected {
  Header,
  Content { length: usize },
}

#[derive(thiserror::Error, Debug)]
pub enum FrameReadError {
  #[error("Frame length exceeded expectation of {expected} bytes with {received}")]
  MaxLengthExceeded { expected: usize, received: usize },
  #[error("Unknown frame kind {0:#04x}")]
  UnknownKind(u8),
  #[error("Unexpected end of frame; expected {expected:?}")]
  UnexpectedEnd {
    expected: NextExpected,
    #[source]
    error: std::io::Error,
  },
}

#[derive(thiserror::Error, Debug)]
pub enum FrameWriteError {
  #[error("Frame write failure: {0:?}")]
  UnexpectedEnd(#[from] std::io::Error),
  /// Nothing is written when this occurs, so the stream stays aligned
  #[error("Frame length exceeded expectation of {expected} bytes with {produced}")]
  MaxLengthExceeded { expected: usize, produced: usize },
}

/// Reads one frame; `Ok(None)` when the stream ends cleanly between frames
pub async fn read_frame<R: AsyncRead + Unpin + ?Sized>(
  s: &mut R,
  max_length: usize,
) -> Result<Option<Frame>, FrameReadError> {
  let mut header = [0u8; HEADER_LENGTH];
  let first = s
    .read(&mut header[..1])
    .await
    .map_err(|error| FrameReadError::UnexpectedEnd {
      expected: NextExpected::Header,
      error,
    })?;
  if first == 0 {
    return Ok(None);
  }
  s.read_exact(&mut header[1..])
    .await
    .map_err(|error| FrameReadError::UnexpectedEnd {
      expected: NextExpected::Header,
      error,
    })?;
  let kind = FrameKind::try_from(header[0])?;
  let stream = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
  let length = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;
  if length > max_length {
    return Err(FrameReadError::MaxLengthExceeded {
      expected: max_length,
      received: length,
    });
  }
  let mut payload = vec![0u8; length];
  s.read_exact(payload.as_mut_slice())
    .await
    .map_err(|error| FrameReadError::UnexpectedEnd {
      expected: NextExpected::Content { length },
      error,
    })?;
  Ok(Some(Frame {
    kind,
    stream,
    payload,
  }))
}

/// Writes one frame without flushing
pub async fn write_frame<W: AsyncWrite + Unpin + ?Sized>(
  s: &mut W,
  frame: &Frame,
  max_length: usize,
) -> Result<(), FrameWriteError> {
  if frame.payload.len() > max_length {
    return Err(FrameWriteError::MaxLengthExceeded {
      expected: max_length,
      produced: frame.payload.len(),
    });
  }
  let mut header = [0u8; HEADER_LENGTH];
  header[0] = frame.kind as u8;
  header[1..5].copy_from_slice(&frame.stream.to_be_bytes());
  header[5..].copy_from_slice(&(frame.payload.len() as u32).to_be_bytes());
  s.write_all(&header).await?;
  s.write_all(&frame.payload).await?;
  Ok(())
}
