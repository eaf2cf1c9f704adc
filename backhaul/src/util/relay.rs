// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Byte relaying between opened streams

use std::{
  io,
  pin::Pin,
  task::{Context, Poll},
};

use futures::future::{BoxFuture, FutureExt};
use tokio::{
  io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream},
  net::{tcp, TcpStream},
};

use crate::common::protocol::mux::{MuxReadHalf, MuxStream, MuxWriteHalf};

pub const RELAY_BUFFER_CAPACITY: usize = 1024 * 32;

/// A relay target, optionally able to close only its write direction
pub trait RelayDestination: AsyncWrite + Send + Unpin {
  /// `None` when write-half-close is unsupported
  fn close_write(&mut self) -> Option<BoxFuture<'_, io::Result<()>>> {
    None
  }
}

/// A relay origin, optionally able to close only its read direction.
///
/// Sources without read-half-close are closed entirely by dropping them.
pub trait RelaySource: AsyncRead + Send + Unpin {
  fn close_read(&mut self) -> Option<BoxFuture<'_, io::Result<()>>> {
    None
  }
}

/// Outcome of one direction of a relay
#[derive(Debug)]
pub struct Transferred {
  pub bytes: u64,
  /// The failure that ended the copy early, if any
  pub error: Option<io::Error>,
}

impl Transferred {
  pub fn is_clean(&self) -> bool {
    self.error.is_none()
  }
}

/// Copies `source` into `destination` until end-of-stream or failure, then closes both.
///
/// Copy failures are logged rather than returned as errors; the half-close
/// steps run regardless.
pub async fn relay<D, S>(mut destination: D, mut source: S) -> Transferred
where
  D: RelayDestination,
  S: RelaySource,
{
  let (bytes, error) = {
    let mut reader = BufReader::with_capacity(RELAY_BUFFER_CAPACITY, &mut source);
    let mut writer = Counted::new(&mut destination);
    let error = tokio::io::copy_buf(&mut reader, &mut writer).await.err();
    (writer.bytes, error)
  };
  if let Some(error) = &error {
    tracing::warn!(%error, bytes, "copy error");
  }
  if let Some(closing) = destination.close_write() {
    if let Err(error) = closing.await {
      tracing::debug!(%error, "Destination write-close failed");
    }
  }
  if let Some(closing) = source.close_read() {
    if let Err(error) = closing.await {
      tracing::debug!(%error, "Source read-close failed");
    }
  }
  drop(source);
  drop(destination);
  tracing::trace!(action = "transferred", bytes);
  Transferred { bytes, error }
}

/// Relays both directions between two split streams concurrently.
///
/// Returns the `a`-to-`b` and `b`-to-`a` outcomes, in that order.
pub async fn relay_bidirectional<AW, AR, BW, BR>(
  a: (AW, AR),
  b: (BW, BR),
) -> (Transferred, Transferred)
where
  AW: RelayDestination,
  AR: RelaySource,
  BW: RelayDestination,
  BR: RelaySource,
{
  let (a_writer, a_reader) = a;
  let (b_writer, b_reader) = b;
  futures::future::join(relay(b_writer, a_reader), relay(a_writer, b_reader)).await
}

pin_project_lite::pin_project! {
  /// Tallies bytes accepted by the inner writer, so partial copies are still counted
  struct Counted<W> {
    #[pin]
    inner: W,
    bytes: u64,
  }
}

impl<W> Counted<W> {
  fn new(inner: W) -> Self {
    Self { inner, bytes: 0 }
  }
}

impl<W: AsyncWrite> AsyncWrite for Counted<W> {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<io::Result<usize>> {
    let this = self.project();
    let written = this.inner.poll_write(cx, buf);
    if let Poll::Ready(Ok(n)) = &written {
      *this.bytes += *n as u64;
    }
    written
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    self.project().inner.poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    self.project().inner.poll_shutdown(cx)
  }
}

fn shutdown_of<W: AsyncWrite + Send + Unpin>(writer: &mut W) -> Option<BoxFuture<'_, io::Result<()>>> {
  Some(writer.shutdown().boxed())
}

impl RelayDestination for TcpStream {
  fn close_write(&mut self) -> Option<BoxFuture<'_, io::Result<()>>> {
    shutdown_of(self)
  }
}

impl RelaySource for TcpStream {}

impl RelayDestination for tcp::OwnedWriteHalf {
  fn close_write(&mut self) -> Option<BoxFuture<'_, io::Result<()>>> {
    shutdown_of(self)
  }
}

impl RelaySource for tcp::OwnedReadHalf {}

impl<'a> RelayDestination for tcp::WriteHalf<'a> {
  fn close_write(&mut self) -> Option<BoxFuture<'_, io::Result<()>>> {
    shutdown_of(self)
  }
}

impl<'a> RelaySource for tcp::ReadHalf<'a> {}

impl RelayDestination for DuplexStream {
  fn close_write(&mut self) -> Option<BoxFuture<'_, io::Result<()>>> {
    shutdown_of(self)
  }
}

impl RelaySource for DuplexStream {}

impl<T: AsyncWrite + Send> RelayDestination for tokio::io::WriteHalf<T> {
  fn close_write(&mut self) -> Option<BoxFuture<'_, io::Result<()>>> {
    shutdown_of(self)
  }
}

impl<T: AsyncRead + Send> RelaySource for tokio::io::ReadHalf<T> {}

impl RelayDestination for MuxStream {
  fn close_write(&mut self) -> Option<BoxFuture<'_, io::Result<()>>> {
    shutdown_of(self)
  }
}

impl RelaySource for MuxStream {
  fn close_read(&mut self) -> Option<BoxFuture<'_, io::Result<()>>> {
    MuxStream::close_read(self);
    Some(futures::future::ready(Ok(())).boxed())
  }
}

impl RelayDestination for MuxWriteHalf {
  fn close_write(&mut self) -> Option<BoxFuture<'_, io::Result<()>>> {
    shutdown_of(self)
  }
}

impl RelaySource for MuxReadHalf {
  fn close_read(&mut self) -> Option<BoxFuture<'_, io::Result<()>>> {
    MuxReadHalf::close_read(self);
    Some(futures::future::ready(Ok(())).boxed())
  }
}

impl RelayDestination for Vec<u8> {}

impl RelaySource for &[u8] {}

impl<T: AsRef<[u8]> + Send + Unpin> RelaySource for std::io::Cursor<T> {}

impl<D: RelayDestination + ?Sized> RelayDestination for &mut D {
  fn close_write(&mut self) -> Option<BoxFuture<'_, io::Result<()>>> {
    (**self).close_write()
  }
}

impl<S: RelaySource + ?Sized> RelaySource for &mut S {
  fn close_read(&mut self) -> Option<BoxFuture<'_, io::Result<()>>> {
    (**self).close_read()
  }
}
