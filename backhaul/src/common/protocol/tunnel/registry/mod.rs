// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Tracks the single live transport usable to reach each identity

use std::{
  collections::HashMap,
  fmt::Debug,
  marker::PhantomData,
  sync::Arc,
};

use tokio::sync::RwLock;
use tracing_futures::Instrument;

use super::{Transport, TransportBuilder, TransportError, TransportHandle};
use crate::common::{protocol::address, Identity};

mod notifier;
pub use notifier::{DisconnectEvents, DisconnectNotifier};
#[cfg(test)]
pub use notifier::MockDisconnectNotifier;

#[derive(thiserror::Error, Debug, Clone)]
pub enum RegistryError {
  #[error("{0} is already connected")]
  AlreadyConnected(Identity),
  #[error("Transport initialization failed for {identity}: {source}")]
  TransportInit {
    identity: Identity,
    #[source]
    source: TransportError,
  },
  #[error("{0} is not connected")]
  NotConnected(Identity),
}

/// A connection the registry refused, handed back for the caller to close
pub struct Rejected<C> {
  pub error: RegistryError,
  pub connection: C,
}

impl<C> Rejected<C> {
  fn new(error: RegistryError, connection: C) -> Self {
    Self { error, connection }
  }

  pub fn into_parts(self) -> (RegistryError, C) {
    (self.error, self.connection)
  }
}

impl<C> std::fmt::Debug for Rejected<C> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Rejected")
      .field("error", &self.error)
      .finish_non_exhaustive()
  }
}

impl<C> std::fmt::Display for Rejected<C> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    std::fmt::Display::fmt(&self.error, f)
  }
}

impl<C> std::error::Error for Rejected<C> {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    std::error::Error::source(&self.error)
  }
}

type TransportOf<C, B> = <B as TransportBuilder<C>>::Transport;

enum Entry<T> {
  /// Claimed by an `add` whose handshake is still running
  Pending,
  Live(Arc<T>),
}

impl<T> Entry<T> {
  fn live(&self) -> Option<&Arc<T>> {
    match self {
      Entry::Pending => None,
      Entry::Live(transport) => Some(transport),
    }
  }
}

type ConnectionMap<T> = HashMap<String, Entry<T>>;

struct Shared<C, B: TransportBuilder<C>> {
  builder: B,
  /// Keyed by [address::encode] of the owning identity
  connections: RwLock<ConnectionMap<TransportOf<C, B>>>,
  notifier: Option<Arc<dyn DisconnectNotifier>>,
  _connection: PhantomData<fn(C)>,
}

/// Maps each [Identity] to at most one live [Transport].
///
/// Lookups share a read lock; additions and removals take the write lock
/// briefly, and never across a handshake. Cloning yields another reference
/// to the same registry.
pub struct ConnectionRegistry<C, B: TransportBuilder<C>> {
  shared: Arc<Shared<C, B>>,
}

impl<C, B: TransportBuilder<C>> Clone for ConnectionRegistry<C, B> {
  fn clone(&self) -> Self {
    Self {
      shared: Arc::clone(&self.shared),
    }
  }
}

impl<C, B> ConnectionRegistry<C, B>
where
  C: Send + 'static,
  B: TransportBuilder<C>,
{
  pub fn new(builder: B) -> Self {
    Self::build(builder, None)
  }

  pub fn with_notifier<N: DisconnectNotifier>(builder: B, notifier: N) -> Self {
    Self::build(builder, Some(Arc::new(notifier)))
  }

  fn build(builder: B, notifier: Option<Arc<dyn DisconnectNotifier>>) -> Self {
    Self {
      shared: Arc::new(Shared {
        builder,
        connections: RwLock::new(HashMap::new()),
        notifier,
        _connection: PhantomData,
      }),
    }
  }

  /// Negotiates a transport over `connection` and registers it for `identity`.
  ///
  /// A live registration is never replaced; the duplicate is handed back in
  /// [Rejected], as is a connection whose handshake failed. The identity is
  /// reserved while the handshake runs, so racing additions for it resolve to
  /// exactly one winner without holding up other identities. The handshake is
  /// unbounded; callers wanting a deadline wrap this in a timeout, and
  /// dropping the future releases the reservation.
  #[tracing::instrument(level = "debug", skip_all, fields(%identity))]
  pub async fn add(&self, identity: Identity, mut connection: C) -> Result<(), Rejected<C>> {
    let reservation = match self.reserve(address::encode(&identity)).await {
      Some(reservation) => reservation,
      None => {
        tracing::debug!("Rejecting duplicate connection");
        return Err(Rejected::new(
          RegistryError::AlreadyConnected(identity),
          connection,
        ));
      }
    };
    let handshake = self.shared.builder.handshake(&mut connection).await;
    let mut connections = self.shared.connections.write().await;
    if let Err(source) = handshake {
      reservation.settle(&mut connections, None);
      drop(connections);
      tracing::debug!(error = %source, "Transport handshake failed");
      return Err(Rejected::new(
        RegistryError::TransportInit { identity, source },
        connection,
      ));
    }
    let transport = Arc::new(self.shared.builder.build(connection));
    reservation.settle(&mut connections, Some(Arc::clone(&transport)));
    drop(connections);
    self.watch(identity, &transport);
    tracing::debug!("Connection registered");
    Ok(())
  }

  async fn reserve(&self, key: String) -> Option<Reservation<C, B>> {
    let mut connections = self.shared.connections.write().await;
    if connections.contains_key(&key) {
      return None;
    }
    connections.insert(key.clone(), Entry::Pending);
    Some(Reservation {
      shared: Arc::clone(&self.shared),
      key: Some(key),
    })
  }

  /// Evicts the transport as soon as it reports itself closed
  fn watch(&self, identity: Identity, transport: &Arc<TransportOf<C, B>>) {
    let closed = transport.on_closed();
    let target = Arc::downgrade(transport);
    let registry = Arc::downgrade(&self.shared);
    tokio::spawn(
      async move {
        closed.await;
        if let Some(shared) = registry.upgrade() {
          if shared.evict_where(|t| std::ptr::eq(Arc::as_ptr(t), target.as_ptr())).await {
            tracing::debug!("Evicted closed transport");
          }
        }
      }
      .instrument(tracing::debug_span!("registry_watch", %identity)),
    );
  }

  /// Returns a handle for `identity` if its transport can take new streams
  pub async fn lookup(
    &self,
    identity: &Identity,
  ) -> Result<TransportHandle<TransportOf<C, B>>, RegistryError> {
    let connections = self.shared.connections.read().await;
    match connections.get(&address::encode(identity)).and_then(Entry::live) {
      Some(transport) if transport.can_take_new_stream() => {
        Ok(TransportHandle::new(Arc::clone(transport)))
      }
      _ => Err(RegistryError::NotConnected(*identity)),
    }
  }

  /// Closes and forgets the transport for `identity`, if any
  ///
  /// An identity whose handshake is still in progress is not connected yet,
  /// and is left alone.
  pub async fn remove(&self, identity: &Identity) {
    let key = address::encode(identity);
    let mut connections = self.shared.connections.write().await;
    match connections.remove(&key) {
      Some(Entry::Live(transport)) => {
        transport.close();
        tracing::debug!(%identity, "Connection removed");
        self.shared.notify(identity);
      }
      Some(Entry::Pending) => {
        connections.insert(key, Entry::Pending);
      }
      None => {}
    }
  }

  /// Evicts whichever identity the handle's transport is registered under.
  ///
  /// For failure-detection paths that only know the transport. Handles that
  /// are no longer registered are ignored.
  pub async fn mark_dead(&self, handle: &TransportHandle<TransportOf<C, B>>) {
    if self.shared.evict_where(|t| handle.refers_to(t)).await {
      tracing::debug!(?handle, "Dead transport evicted");
    }
  }

  pub fn url(&self, identity: &Identity) -> String {
    address::url(identity)
  }

  pub async fn contains(&self, identity: &Identity) -> bool {
    let connections = self.shared.connections.read().await;
    connections
      .get(&address::encode(identity))
      .and_then(Entry::live)
      .is_some()
  }

  pub async fn identities(&self) -> Vec<Identity> {
    let connections = self.shared.connections.read().await;
    connections
      .iter()
      .filter(|(_, entry)| entry.live().is_some())
      .map(|(key, _)| address::decode(key))
      .collect()
  }

  pub async fn len(&self) -> usize {
    let connections = self.shared.connections.read().await;
    connections.values().filter(|entry| entry.live().is_some()).count()
  }

  pub async fn is_empty(&self) -> bool {
    self.len().await == 0
  }
}

/// Claim on an identity's key for the duration of one handshake
struct Reservation<C: Send + 'static, B: TransportBuilder<C>> {
  shared: Arc<Shared<C, B>>,
  key: Option<String>,
}

impl<C: Send + 'static, B: TransportBuilder<C>> Reservation<C, B> {
  /// Replaces the claim with `transport`, or drops it; the write lock must be held
  fn settle(
    mut self,
    connections: &mut ConnectionMap<TransportOf<C, B>>,
    transport: Option<Arc<TransportOf<C, B>>>,
  ) {
    if let Some(key) = self.key.take() {
      match transport {
        Some(transport) => {
          connections.insert(key, Entry::Live(transport));
        }
        None => {
          connections.remove(&key);
        }
      }
    }
  }
}

impl<C: Send + 'static, B: TransportBuilder<C>> Drop for Reservation<C, B> {
  fn drop(&mut self) {
    // Only reached when `add` was cancelled mid-handshake
    let runtime = tokio::runtime::Handle::try_current();
    if let (Some(key), Ok(runtime)) = (self.key.take(), runtime) {
      let shared = Arc::clone(&self.shared);
      runtime.spawn(async move {
        let mut connections = shared.connections.write().await;
        if let Some(Entry::Pending) = connections.get(&key) {
          connections.remove(&key);
          tracing::debug!(address = %key, "Released reservation of an abandoned handshake");
        }
      });
    }
  }
}

impl<C, B: TransportBuilder<C>> Shared<C, B> {
  /// Removes the first live entry matching `predicate`; linear in live connections
  async fn evict_where<P>(&self, predicate: P) -> bool
  where
    P: Fn(&Arc<TransportOf<C, B>>) -> bool,
  {
    let mut connections = self.connections.write().await;
    let key = connections
      .iter()
      .find(|(_, entry)| entry.live().map_or(false, |transport| predicate(transport)))
      .map(|(key, _)| key.clone());
    match key.and_then(|key| connections.remove_entry(&key)) {
      Some((key, entry)) => {
        if let Entry::Live(transport) = entry {
          transport.close();
        }
        self.notify(&address::decode(&key));
        true
      }
      None => false,
    }
  }

  /// Runs with the write lock held, so notices stay ordered with registrations
  fn notify(&self, identity: &Identity) {
    if let Some(notifier) = &self.notifier {
      notifier.on_disconnect(identity);
    }
  }
}

impl<C, B: TransportBuilder<C>> Debug for ConnectionRegistry<C, B> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ConnectionRegistry").finish_non_exhaustive()
  }
}
