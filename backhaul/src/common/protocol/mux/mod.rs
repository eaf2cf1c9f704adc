// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Many logical streams over one raw connection
//!
//! Each session runs a reader, a writer, and optionally a keepalive task, plus
//! one task per logical stream bridging a [tokio::io::DuplexStream] handed to
//! the user onto [frames](frame::Frame). Stream identifiers are odd for the
//! [Side::Connect] end and even for the [Side::Listen] end, so both ends may
//! open streams without coordination.
//!
//! Each direction of a stream carries at most [MuxConfig::stream_buffer_size]
//! unacknowledged bytes. The receiver returns credit in
//! [Window](frame::FrameKind::Window) frames as the user end drains, so a
//! stream that is never read stalls only itself.

use std::{
  collections::HashMap,
  sync::{Arc, Mutex, MutexGuard},
  time::Duration,
};

use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use tokio::{
  io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream},
  sync::{mpsc, Semaphore},
  time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use super::{
  negotiation::negotiate,
  tunnel::{Transport, TransportBuilder, TransportError},
};

pub mod frame;
mod stream;

use frame::{read_frame, write_frame, Frame, FrameKind, FrameReadError, FrameWriteError};
pub use frame::StreamId;
pub use stream::{MuxReadHalf, MuxStream, MuxWriteHalf};
use stream::StreamState;

const OUTBOUND_QUEUE_DEPTH: usize = 64;
const MIN_FRAME_SIZE: usize = 64;
const MAX_STREAM_WINDOW: usize = 1 << 28;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Side {
  /// The end that dialed; on a relay, this is the end opening streams
  Connect,
  Listen,
}

impl Side {
  fn first_stream_id(self) -> StreamId {
    match self {
      Side::Connect => 1,
      Side::Listen => 2,
    }
  }

  fn owns(self, id: StreamId) -> bool {
    id % 2 == self.first_stream_id() % 2
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
  /// Largest payload carried by one frame; both ends must agree
  pub max_frame_size: usize,
  pub max_concurrent_streams: usize,
  /// Per-stream window: bytes either end may send ahead of the reader's
  /// acknowledgement. Both ends must agree
  pub stream_buffer_size: usize,
  pub keepalive_interval_ms: u64,
  /// Session closes when nothing arrives for this long; `0` disables keepalive
  pub keepalive_timeout_ms: u64,
}

impl Default for MuxConfig {
  fn default() -> Self {
    Self {
      max_frame_size: 16 * 1024,
      max_concurrent_streams: 256,
      stream_buffer_size: 64 * 1024,
      keepalive_interval_ms: 15_000,
      keepalive_timeout_ms: 45_000,
    }
  }
}

impl MuxConfig {
  /// Ping interval and idle timeout, if keepalive is enabled
  pub fn keepalive(&self) -> Option<(Duration, Duration)> {
    if self.keepalive_interval_ms == 0 || self.keepalive_timeout_ms == 0 {
      return None;
    }
    Some((
      Duration::from_millis(self.keepalive_interval_ms),
      Duration::from_millis(self.keepalive_timeout_ms),
    ))
  }

  fn sanitized(mut self) -> Self {
    self.max_frame_size = self.max_frame_size.max(MIN_FRAME_SIZE);
    self.stream_buffer_size = self.stream_buffer_size.clamp(1, MAX_STREAM_WINDOW);
    self
  }
}

enum Inbound {
  Data(Vec<u8>),
  Fin,
}

struct StreamSlot {
  inbound: mpsc::UnboundedSender<Inbound>,
  reset: CancellationToken,
  /// Bytes this end may still send
  send_credit: Arc<Semaphore>,
  /// Bytes received but not yet handed to the user end
  unacknowledged: usize,
}

struct StreamTable {
  slots: HashMap<StreamId, StreamSlot>,
  /// `None` once the identifier space is exhausted
  next_id: Option<StreamId>,
}

struct SessionShared {
  side: Side,
  config: MuxConfig,
  streams: Mutex<StreamTable>,
  outbound: mpsc::Sender<Frame>,
  closed: CancellationToken,
  last_seen: Mutex<Instant>,
}

impl SessionShared {
  fn close(&self) {
    if !self.closed.is_cancelled() {
      tracing::debug!(side = ?self.side, "Closing mux session");
    }
    self.closed.cancel();
  }

  async fn send(&self, frame: Frame) -> Result<(), TransportError> {
    if self.closed.is_cancelled() {
      return Err(TransportError::ConnectionClosed);
    }
    self
      .outbound
      .send(frame)
      .await
      .map_err(|_| TransportError::ConnectionClosed)
  }

  fn table(&self) -> MutexGuard<'_, StreamTable> {
    self.streams.lock().expect("Mutex poisoned")
  }

  fn last_seen(&self) -> MutexGuard<'_, Instant> {
    self.last_seen.lock().expect("Mutex poisoned")
  }

  fn touch(&self) {
    *self.last_seen() = Instant::now();
  }

  fn idle_for(&self) -> Duration {
    self.last_seen().elapsed()
  }

  fn active_streams(&self) -> usize {
    self.table().slots.len()
  }

  fn can_take_new_stream(&self) -> bool {
    if self.closed.is_cancelled() {
      return false;
    }
    let table = self.table();
    table.next_id.is_some() && table.slots.len() < self.config.max_concurrent_streams
  }

  fn register(&self, table: &mut StreamTable, id: StreamId) -> (MuxStream, Pump) {
    let (user, bridge) = tokio::io::duplex(self.config.stream_buffer_size);
    let (inbound, inbound_queue) = mpsc::unbounded_channel();
    let reset = self.closed.child_token();
    let send_credit = Arc::new(Semaphore::new(self.config.stream_buffer_size));
    let state = Arc::new(StreamState::default());
    table.slots.insert(
      id,
      StreamSlot {
        inbound,
        reset: reset.clone(),
        send_credit: Arc::clone(&send_credit),
        unacknowledged: 0,
      },
    );
    let pump = Pump {
      id,
      bridge,
      inbound: inbound_queue,
      reset,
      send_credit,
      state: Arc::clone(&state),
    };
    (MuxStream::new(id, user, state), pump)
  }

  fn allocate_local(&self) -> Result<(MuxStream, Pump), TransportError> {
    if self.closed.is_cancelled() {
      return Err(TransportError::ConnectionClosed);
    }
    let mut table = self.table();
    if table.slots.len() >= self.config.max_concurrent_streams {
      return Err(TransportError::Refused("concurrent stream limit reached"));
    }
    let id = table
      .next_id
      .ok_or(TransportError::Refused("stream identifiers exhausted"))?;
    table.next_id = id.checked_add(2);
    Ok(self.register(&mut table, id))
  }

  fn release(&self, id: StreamId) {
    self.table().slots.remove(&id);
  }

  fn reset_stream(&self, id: StreamId) {
    if let Some(slot) = self.table().slots.get(&id) {
      slot.reset.cancel();
    }
  }

  /// Queues inbound data without waiting on the stream's reader.
  ///
  /// Returns `false`, after resetting the stream locally, if the peer sent
  /// beyond the window it was granted.
  fn deliver(&self, id: StreamId, message: Inbound) -> bool {
    let window = self.config.stream_buffer_size;
    let mut table = self.table();
    let slot = match table.slots.get_mut(&id) {
      Some(slot) => slot,
      None => {
        tracing::trace!(stream = id, "Discarding frame for unknown stream");
        return true;
      }
    };
    if let Inbound::Data(payload) = &message {
      slot.unacknowledged += payload.len();
      if slot.unacknowledged > window {
        slot.reset.cancel();
        return false;
      }
    }
    if slot.inbound.send(message).is_err() {
      tracing::trace!(stream = id, "Discarding frame for a stream no longer reading");
    }
    true
  }

  /// Records that `length` inbound bytes left the session for the user end
  fn acknowledge(&self, id: StreamId, length: usize) {
    if let Some(slot) = self.table().slots.get_mut(&id) {
      slot.unacknowledged = slot.unacknowledged.saturating_sub(length);
    }
  }

  /// Returns send credit granted by the peer; `false` if it overflows the window
  fn grant(&self, id: StreamId, credit: u32) -> bool {
    let table = self.table();
    let slot = match table.slots.get(&id) {
      Some(slot) => slot,
      None => return true,
    };
    let credit = credit as usize;
    if slot.send_credit.available_permits() + credit > self.config.stream_buffer_size {
      slot.reset.cancel();
      return false;
    }
    slot.send_credit.add_permits(credit);
    true
  }

  async fn accept_remote(self: &Arc<Self>, id: StreamId, incoming: &mpsc::Sender<MuxStream>) {
    let accepted = {
      let mut table = self.table();
      if id == 0 || self.side.owns(id) || table.slots.contains_key(&id) {
        tracing::warn!(stream = id, "Peer opened a stream with an invalid identifier");
        None
      } else if table.slots.len() >= self.config.max_concurrent_streams {
        tracing::debug!(stream = id, "Refusing stream beyond the concurrency limit");
        None
      } else {
        Some(self.register(&mut table, id))
      }
    };
    if let Some((stream, pump)) = accepted {
      if incoming.try_send(stream).is_ok() {
        pump.spawn(Arc::clone(self));
        return;
      }
      tracing::debug!(stream = id, "Accept queue unavailable; refusing stream");
      self.release(id);
    }
    self.send(Frame::reset(id)).await.ok();
  }
}

/// Moves bytes between one logical stream's user end and the session's frames
struct Pump {
  id: StreamId,
  bridge: DuplexStream,
  inbound: mpsc::UnboundedReceiver<Inbound>,
  reset: CancellationToken,
  send_credit: Arc<Semaphore>,
  state: Arc<StreamState>,
}

impl Pump {
  fn spawn(self, shared: Arc<SessionShared>) {
    let span = tracing::trace_span!("mux_stream", stream = self.id);
    tokio::spawn(self.run(shared).instrument(span));
  }

  async fn run(self, shared: Arc<SessionShared>) {
    let Pump {
      id,
      bridge,
      mut inbound,
      reset,
      send_credit,
      state,
    } = self;
    let (mut bridge_r, mut bridge_w) = tokio::io::split(bridge);
    let uplink = async {
      let chunk = shared
        .config
        .max_frame_size
        .min(shared.config.stream_buffer_size);
      let mut buffer = vec![0u8; chunk];
      loop {
        match bridge_r.read(&mut buffer).await {
          Ok(0) => {
            shared.send(Frame::fin(id)).await.ok();
            break;
          }
          Ok(n) => {
            // `n` never exceeds the window, so this waits only for acknowledgements
            match send_credit.acquire_many(n as u32).await {
              Ok(permits) => permits.forget(),
              Err(_) => break,
            }
            if shared.send(Frame::data(id, buffer[..n].to_vec())).await.is_err() {
              break;
            }
          }
          Err(error) => {
            tracing::debug!(%error, "Local stream read failed; resetting");
            shared.send(Frame::reset(id)).await.ok();
            break;
          }
        }
      }
    };
    let downlink = async {
      while let Some(message) = inbound.recv().await {
        match message {
          Inbound::Data(payload) => {
            if !state.is_read_closed() {
              if let Err(error) = bridge_w.write_all(&payload).await {
                tracing::trace!(%error, "Local reader went away; resetting");
                shared.send(Frame::reset(id)).await.ok();
                break;
              }
            }
            shared.acknowledge(id, payload.len());
            // Payloads never exceed the frame size, which fits in a u32
            if shared.send(Frame::window(id, payload.len() as u32)).await.is_err() {
              break;
            }
          }
          Inbound::Fin => {
            state.finish_remote();
            bridge_w.shutdown().await.ok();
            break;
          }
        }
      }
      // Frames arriving after this point are refused rather than queued
      inbound.close();
    };
    tokio::select! {
      _ = reset.cancelled() => {
        tracing::trace!("Stream reset");
        state.abort();
      }
      _ = futures::future::join(uplink, downlink) => tracing::trace!("Stream finished"),
    }
    shared.release(id);
  }
}

async fn read_frames<R>(
  shared: &Arc<SessionShared>,
  mut source: R,
  incoming: mpsc::Sender<MuxStream>,
) -> Result<(), FrameReadError>
where
  R: AsyncRead + Unpin,
{
  let max_length = shared.config.max_frame_size;
  while let Some(frame) = read_frame(&mut source, max_length).await? {
    shared.touch();
    match frame.kind {
      FrameKind::Ping => {
        shared.send(Frame::pong()).await.ok();
      }
      FrameKind::Pong => {}
      FrameKind::Open => shared.accept_remote(frame.stream, &incoming).await,
      FrameKind::Data => {
        if !shared.deliver(frame.stream, Inbound::Data(frame.payload)) {
          tracing::warn!(stream = frame.stream, "Peer overran the stream window; resetting");
          shared.send(Frame::reset(frame.stream)).await.ok();
        }
      }
      FrameKind::Fin => {
        shared.deliver(frame.stream, Inbound::Fin);
      }
      FrameKind::Reset => shared.reset_stream(frame.stream),
      FrameKind::Window => {
        let granted = match frame.credit() {
          Some(credit) => shared.grant(frame.stream, credit),
          None => {
            shared.reset_stream(frame.stream);
            false
          }
        };
        if !granted {
          tracing::warn!(stream = frame.stream, "Peer sent an invalid window update; resetting");
          shared.send(Frame::reset(frame.stream)).await.ok();
        }
      }
    }
  }
  tracing::debug!("Peer closed the connection");
  Ok(())
}

async fn write_frames<W>(
  shared: &SessionShared,
  mut sink: W,
  mut queue: mpsc::Receiver<Frame>,
) -> Result<(), FrameWriteError>
where
  W: AsyncWrite + Unpin,
{
  let max_length = shared.config.max_frame_size;
  while let Some(frame) = queue.recv().await {
    write_frame(&mut sink, &frame, max_length).await?;
    // Drain whatever queued up meanwhile before paying for a flush
    while let Ok(frame) = queue.try_recv() {
      write_frame(&mut sink, &frame, max_length).await?;
    }
    sink.flush().await?;
  }
  Ok(())
}

async fn keep_alive(shared: &SessionShared, interval: Duration, timeout: Duration) {
  let mut ticker = tokio::time::interval(interval);
  ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
  loop {
    ticker.tick().await;
    if shared.idle_for() >= timeout {
      tracing::warn!(?timeout, "Keepalive timed out; closing session");
      shared.close();
      return;
    }
    if shared.send(Frame::ping()).await.is_err() {
      return;
    }
  }
}

/// A multiplexed session over one raw connection
pub struct MuxSession {
  shared: Arc<SessionShared>,
  incoming: tokio::sync::Mutex<mpsc::Receiver<MuxStream>>,
}

impl MuxSession {
  /// Starts a session over an already-negotiated connection
  pub fn start<C>(connection: C, side: Side, config: MuxConfig) -> MuxSession
  where
    C: AsyncRead + AsyncWrite + Send + 'static,
  {
    let config = config.sanitized();
    let (source, sink) = tokio::io::split(connection);
    let (outbound, queue) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
    let (incoming, incoming_queue) = mpsc::channel(config.max_concurrent_streams.max(1));
    let keepalive = config.keepalive();
    let shared = Arc::new(SessionShared {
      side,
      streams: Mutex::new(StreamTable {
        slots: HashMap::new(),
        next_id: Some(side.first_stream_id()),
      }),
      outbound,
      closed: CancellationToken::new(),
      last_seen: Mutex::new(Instant::now()),
      config,
    });

    tokio::spawn({
      let shared = Arc::clone(&shared);
      async move {
        let result = tokio::select! {
          _ = shared.closed.cancelled() => Ok(()),
          result = write_frames(&shared, sink, queue) => result,
        };
        if let Err(error) = result {
          tracing::debug!(%error, "Frame write failed");
        }
        shared.close();
      }
      .instrument(tracing::debug_span!("mux_writer", ?side))
    });

    tokio::spawn({
      let shared = Arc::clone(&shared);
      async move {
        let result = tokio::select! {
          _ = shared.closed.cancelled() => Ok(()),
          result = read_frames(&shared, source, incoming) => result,
        };
        if let Err(error) = result {
          tracing::debug!(%error, "Frame read failed");
        }
        shared.close();
      }
      .instrument(tracing::debug_span!("mux_reader", ?side))
    });

    if let Some((interval, timeout)) = keepalive {
      tokio::spawn({
        let shared = Arc::clone(&shared);
        async move {
          tokio::select! {
            _ = shared.closed.cancelled() => {},
            _ = keep_alive(&shared, interval, timeout) => {},
          }
        }
        .instrument(tracing::debug_span!("mux_keepalive", ?side))
      });
    }

    MuxSession {
      shared,
      incoming: tokio::sync::Mutex::new(incoming_queue),
    }
  }

  /// Negotiates and starts the dialing end of a session
  pub async fn connect<C>(mut connection: C, config: MuxConfig) -> Result<MuxSession, TransportError>
  where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
  {
    negotiate(&mut connection).await?;
    Ok(Self::start(connection, Side::Connect, config))
  }

  /// Negotiates and starts the accepting end of a session
  pub async fn listen<C>(mut connection: C, config: MuxConfig) -> Result<MuxSession, TransportError>
  where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
  {
    negotiate(&mut connection).await?;
    Ok(Self::start(connection, Side::Listen, config))
  }

  pub fn side(&self) -> Side {
    self.shared.side
  }

  pub fn open_stream(&self) -> BoxFuture<'static, Result<MuxStream, TransportError>> {
    let shared = Arc::clone(&self.shared);
    async move {
      let (stream, pump) = shared.allocate_local()?;
      let id = stream.id();
      // Open must be queued ahead of any data the pump produces
      if let Err(e) = shared.send(Frame::open(id)).await {
        shared.release(id);
        return Err(e);
      }
      pump.spawn(Arc::clone(&shared));
      Ok(stream)
    }
    .boxed()
  }

  /// Waits for the peer to open a stream; `None` once the session is closed
  pub async fn accept(&self) -> Option<MuxStream> {
    self.incoming.lock().await.recv().await
  }

  pub fn can_take_new_stream(&self) -> bool {
    self.shared.can_take_new_stream()
  }

  pub fn active_streams(&self) -> usize {
    self.shared.active_streams()
  }

  pub fn close(&self) {
    self.shared.close()
  }

  pub fn is_closed(&self) -> bool {
    self.shared.closed.is_cancelled()
  }

  pub fn on_closed(&self) -> BoxFuture<'static, ()> {
    let closed = self.shared.closed.clone();
    async move { closed.cancelled().await }.boxed()
  }
}

impl Drop for MuxSession {
  fn drop(&mut self) {
    self.shared.close();
  }
}

impl std::fmt::Debug for MuxSession {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("MuxSession")
      .field("side", &self.shared.side)
      .field("closed", &self.is_closed())
      .finish_non_exhaustive()
  }
}

impl Transport for MuxSession {
  type Stream = MuxStream;

  fn open_stream(&self) -> BoxFuture<'static, Result<MuxStream, TransportError>> {
    MuxSession::open_stream(self)
  }

  fn can_take_new_stream(&self) -> bool {
    MuxSession::can_take_new_stream(self)
  }

  fn close(&self) {
    MuxSession::close(self)
  }

  fn on_closed(&self) -> BoxFuture<'static, ()> {
    MuxSession::on_closed(self)
  }
}

/// Builds [MuxSession]s for a [ConnectionRegistry](super::tunnel::registry::ConnectionRegistry)
#[derive(Debug, Clone)]
pub struct MuxBuilder {
  side: Side,
  config: MuxConfig,
}

impl MuxBuilder {
  pub fn new(side: Side, config: MuxConfig) -> Self {
    Self { side, config }
  }
}

impl<C> TransportBuilder<C> for MuxBuilder
where
  C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
  type Transport = MuxSession;

  fn handshake<'a>(&'a self, connection: &'a mut C) -> BoxFuture<'a, Result<(), TransportError>> {
    negotiate(connection).map(|r| r.map_err(Into::into)).boxed()
  }

  fn build(&self, connection: C) -> MuxSession {
    MuxSession::start(connection, self.side, self.config.clone())
  }
}

#[cfg(test)]
mod tests;
