// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

#![warn(unused_imports, dead_code, unused_variables)]

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};

use super::negotiation::NegotiationError;

pub mod registry;

#[derive(thiserror::Error, Debug, Clone)]
pub enum TransportError {
  #[error("Connection closed")]
  ConnectionClosed,
  #[error("Transport refused a new stream: {0}")]
  Refused(&'static str),
  #[error("Transport handshake failed: {0}")]
  Handshake(
    #[from]
    #[source]
    NegotiationError,
  ),
  #[error("Transport I/O failure: {0}")]
  Io(#[source] Arc<std::io::Error>),
}

impl From<std::io::Error> for TransportError {
  fn from(e: std::io::Error) -> Self {
    Self::Io(Arc::new(e))
  }
}

/// One physical connection able to carry many independent logical streams
pub trait Transport: Send + Sync + 'static {
  type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

  /// Opens a new logical stream to the remote
  fn open_stream(&self) -> BoxFuture<'static, Result<Self::Stream, TransportError>>;

  /// If the transport is alive and below its concurrent stream limit
  fn can_take_new_stream(&self) -> bool;

  /// Closes the underlying connection; open streams fail shortly after
  fn close(&self);

  /// Resolves once the transport is closed, locally or through failure
  fn on_closed(&self) -> BoxFuture<'static, ()>;
}

/// Negotiates and constructs a [Transport] over a raw connection.
///
/// The handshake only borrows the connection so that a failed negotiation
/// leaves it with the caller, who remains responsible for closing it.
pub trait TransportBuilder<C>: Send + Sync + 'static {
  type Transport: Transport;

  fn handshake<'a>(&'a self, connection: &'a mut C) -> BoxFuture<'a, Result<(), TransportError>>;

  /// Takes ownership of a negotiated connection
  fn build(&self, connection: C) -> Self::Transport;
}

/// A shared reference to a registered [Transport].
///
/// Handles can open streams but cannot close the transport; its lifetime
/// belongs to whoever registered it.
pub struct TransportHandle<T> {
  inner: Arc<T>,
}

impl<T> TransportHandle<T> {
  pub(crate) fn new(inner: Arc<T>) -> Self {
    Self { inner }
  }

  /// If both handles refer to the same transport instance
  pub fn same_transport(&self, other: &Self) -> bool {
    Arc::ptr_eq(&self.inner, &other.inner)
  }

  pub(crate) fn refers_to(&self, transport: &Arc<T>) -> bool {
    Arc::ptr_eq(&self.inner, transport)
  }
}

impl<T: Transport> TransportHandle<T> {
  pub fn open_stream(&self) -> BoxFuture<'static, Result<T::Stream, TransportError>> {
    self.inner.open_stream()
  }

  pub fn can_take_new_stream(&self) -> bool {
    self.inner.can_take_new_stream()
  }
}

impl<T> Clone for TransportHandle<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<T> std::fmt::Debug for TransportHandle<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TransportHandle")
      .field("transport", &Arc::as_ptr(&self.inner))
      .finish()
  }
}
