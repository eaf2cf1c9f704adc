// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{
  io::{Error as IOError, ErrorKind},
  pin::Pin,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
  task::{Context, Poll},
};

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf, ReadHalf, WriteHalf};

use super::frame::StreamId;

/// Flags shared by a stream's user end and the task pumping its frames
#[derive(Debug, Default)]
pub(super) struct StreamState {
  read_closed: AtomicBool,
  remote_finished: AtomicBool,
  aborted: AtomicBool,
}

impl StreamState {
  pub(super) fn close_read(&self) {
    self.read_closed.store(true, Ordering::Release);
  }

  pub(super) fn is_read_closed(&self) -> bool {
    self.read_closed.load(Ordering::Acquire)
  }

  /// The peer half-closed; end-of-stream from here on is genuine
  pub(super) fn finish_remote(&self) {
    self.remote_finished.store(true, Ordering::Release);
  }

  /// Set before the pump drops its end, so the user end sees it at end-of-stream
  pub(super) fn abort(&self) {
    self.aborted.store(true, Ordering::Release);
  }

  fn is_aborted(&self) -> bool {
    self.aborted.load(Ordering::Acquire)
  }

  fn is_truncated(&self) -> bool {
    self.is_aborted() && !self.remote_finished.load(Ordering::Acquire)
  }
}

fn reset_error() -> IOError {
  IOError::new(ErrorKind::ConnectionReset, "mux stream was reset")
}

/// Reports end-of-stream as a reset unless the peer actually finished
fn poll_read_checked<R: AsyncRead>(
  inner: Pin<&mut R>,
  state: &StreamState,
  cx: &mut Context<'_>,
  buf: &mut ReadBuf<'_>,
) -> Poll<Result<(), IOError>> {
  let filled = buf.filled().len();
  match inner.poll_read(cx, buf) {
    Poll::Ready(Ok(())) if buf.filled().len() == filled && buf.remaining() > 0 => {
      if state.is_truncated() {
        Poll::Ready(Err(reset_error()))
      } else {
        Poll::Ready(Ok(()))
      }
    }
    polled => polled,
  }
}

fn poll_write_checked<W: AsyncWrite>(
  inner: Pin<&mut W>,
  state: &StreamState,
  cx: &mut Context<'_>,
  buf: &[u8],
) -> Poll<Result<usize, IOError>> {
  if state.is_aborted() {
    return Poll::Ready(Err(reset_error()));
  }
  inner.poll_write(cx, buf)
}

pin_project_lite::pin_project! {
  /// One logical stream of a [MuxSession](super::MuxSession).
  ///
  /// Shutting down the write side sends a half-close to the peer, which
  /// reads end-of-stream but may keep writing back.
  pub struct MuxStream {
    id: StreamId,
    #[pin]
    inner: DuplexStream,
    state: Arc<StreamState>,
  }
}

pin_project_lite::pin_project! {
  pub struct MuxReadHalf {
    id: StreamId,
    #[pin]
    inner: ReadHalf<DuplexStream>,
    state: Arc<StreamState>,
  }
}

pin_project_lite::pin_project! {
  pub struct MuxWriteHalf {
    id: StreamId,
    #[pin]
    inner: WriteHalf<DuplexStream>,
    state: Arc<StreamState>,
  }
}

impl MuxStream {
  pub(super) fn new(id: StreamId, inner: DuplexStream, state: Arc<StreamState>) -> Self {
    Self { id, inner, state }
  }

  pub fn id(&self) -> StreamId {
    self.id
  }

  /// Stops delivery of further inbound data; data already buffered stays readable
  pub fn close_read(&self) {
    self.state.close_read();
  }

  pub fn into_split(self) -> (MuxReadHalf, MuxWriteHalf) {
    let (reader, writer) = tokio::io::split(self.inner);
    (
      MuxReadHalf {
        id: self.id,
        inner: reader,
        state: Arc::clone(&self.state),
      },
      MuxWriteHalf {
        id: self.id,
        inner: writer,
        state: self.state,
      },
    )
  }
}

impl MuxReadHalf {
  pub fn id(&self) -> StreamId {
    self.id
  }

  pub fn close_read(&self) {
    self.state.close_read();
  }
}

impl MuxWriteHalf {
  pub fn id(&self) -> StreamId {
    self.id
  }
}

impl std::fmt::Debug for MuxStream {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("MuxStream")
      .field("id", &self.id)
      .finish_non_exhaustive()
  }
}

impl AsyncRead for MuxStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<Result<(), IOError>> {
    let this = self.project();
    poll_read_checked(this.inner, this.state, cx, buf)
  }
}

impl AsyncWrite for MuxStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, IOError>> {
    let this = self.project();
    poll_write_checked(this.inner, this.state, cx, buf)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    self.project().inner.poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    self.project().inner.poll_shutdown(cx)
  }
}

impl AsyncRead for MuxReadHalf {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<Result<(), IOError>> {
    let this = self.project();
    poll_read_checked(this.inner, this.state, cx, buf)
  }
}

impl AsyncWrite for MuxWriteHalf {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, IOError>> {
    let this = self.project();
    poll_write_checked(this.inner, this.state, cx, buf)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    self.project().inner.poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    self.project().inner.poll_shutdown(cx)
  }
}
