// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{io, time::Duration};

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use super::{
  frame::{read_frame, write_frame, Frame, FrameKind},
  MuxConfig, MuxSession,
};
use crate::{
  common::protocol::{negotiation::negotiate, tunnel::TransportError},
  test_support::init_tracing,
  util::relay::relay as forward,
};

const PATIENCE: Duration = Duration::from_secs(5);

fn without_keepalive() -> MuxConfig {
  MuxConfig {
    keepalive_interval_ms: 0,
    ..Default::default()
  }
}

async fn session_pair(config: MuxConfig) -> (MuxSession, MuxSession) {
  let (relay_end, hidden_end) = tokio::io::duplex(64 * 1024);
  let (relay, hidden) = tokio::join!(
    MuxSession::connect(relay_end, config.clone()),
    MuxSession::listen(hidden_end, config),
  );
  (relay.unwrap(), hidden.unwrap())
}

/// A session whose peer negotiated and then went silent
async fn session_with_silent_peer(config: MuxConfig) -> (MuxSession, DuplexStream) {
  let (relay_end, mut peer) = tokio::io::duplex(64 * 1024);
  let (relay, peer_handshake) =
    tokio::join!(MuxSession::connect(relay_end, config), negotiate(&mut peer));
  peer_handshake.unwrap();
  (relay.unwrap(), peer)
}

async fn eventually(mut condition: impl FnMut() -> bool) {
  tokio::time::timeout(PATIENCE, async {
    while !condition() {
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
  })
  .await
  .expect("Condition never held");
}

#[tokio::test]
async fn half_close_keeps_the_other_direction_open() {
  init_tracing();
  let (relay, hidden) = session_pair(without_keepalive()).await;
  let server = tokio::spawn(async move {
    let mut stream = hidden.accept().await.expect("Stream must be accepted");
    let mut request = Vec::new();
    stream.read_to_end(&mut request).await.unwrap();
    stream.write_all(b"response to ").await.unwrap();
    stream.write_all(&request).await.unwrap();
    stream.shutdown().await.unwrap();
    hidden
  });

  let mut stream = relay.open_stream().await.unwrap();
  assert_eq!(stream.id() % 2, 1, "Dialing side allocates odd identifiers");
  stream.write_all(b"request").await.unwrap();
  stream.shutdown().await.unwrap();
  let mut response = Vec::new();
  stream.read_to_end(&mut response).await.unwrap();
  assert_eq!(response, b"response to request");
  let _hidden = server.await.unwrap();
}

#[tokio::test]
async fn listening_side_can_open_streams() {
  init_tracing();
  let (relay, hidden) = session_pair(without_keepalive()).await;
  let mut outbound = hidden.open_stream().await.unwrap();
  assert_eq!(outbound.id(), 2);
  let mut inbound = relay.accept().await.expect("Stream must be accepted");
  assert_eq!(inbound.id(), 2);

  outbound.write_all(b"ping").await.unwrap();
  let mut buffer = [0u8; 4];
  inbound.read_exact(&mut buffer).await.unwrap();
  assert_eq!(&buffer, b"ping");
}

#[tokio::test]
async fn large_writes_are_split_into_frames() {
  init_tracing();
  let (relay, hidden) = session_pair(MuxConfig {
    max_frame_size: 1024,
    ..without_keepalive()
  })
  .await;
  let echo = tokio::spawn(async move {
    let stream = hidden.accept().await.expect("Stream must be accepted");
    let (mut reader, mut writer) = tokio::io::split(stream);
    tokio::io::copy(&mut reader, &mut writer).await.unwrap();
    writer.shutdown().await.unwrap();
    hidden
  });

  let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
  let stream = relay.open_stream().await.unwrap();
  let (mut reader, mut writer) = stream.into_split();
  let send = async {
    writer.write_all(&payload).await.unwrap();
    writer.shutdown().await.unwrap();
  };
  let receive = async {
    let mut echoed = Vec::new();
    reader.read_to_end(&mut echoed).await.unwrap();
    echoed
  };
  let ((), echoed) = tokio::join!(send, receive);
  assert_eq!(echoed.len(), payload.len());
  assert!(echoed == payload, "Echoed bytes must arrive unaltered and in order");
  let _hidden = echo.await.unwrap();
}

#[tokio::test]
async fn closed_read_side_discards_inbound_data() {
  init_tracing();
  let (relay, hidden) = session_pair(without_keepalive()).await;
  let stream = relay.open_stream().await.unwrap();
  let mut accepted = hidden.accept().await.expect("Stream must be accepted");
  let (mut reader, mut writer) = stream.into_split();
  reader.close_read();

  accepted.write_all(b"ignored").await.unwrap();
  accepted.shutdown().await.unwrap();
  let mut received = Vec::new();
  reader.read_to_end(&mut received).await.unwrap();
  assert!(received.is_empty());

  writer.write_all(b"still writable").await.unwrap();
  writer.shutdown().await.unwrap();
  let mut forwarded = Vec::new();
  accepted.read_to_end(&mut forwarded).await.unwrap();
  assert_eq!(forwarded, b"still writable");
}

#[tokio::test]
async fn stream_limit_refuses_excess_streams() {
  init_tracing();
  let (relay, hidden) = session_pair(MuxConfig {
    max_concurrent_streams: 1,
    ..without_keepalive()
  })
  .await;
  assert!(relay.can_take_new_stream());
  let mut first = relay.open_stream().await.unwrap();
  assert!(!relay.can_take_new_stream());
  assert!(matches!(
    relay.open_stream().await,
    Err(TransportError::Refused(_))
  ));

  let mut accepted = hidden.accept().await.expect("Stream must be accepted");
  first.shutdown().await.unwrap();
  accepted.shutdown().await.unwrap();
  let mut drained = Vec::new();
  accepted.read_to_end(&mut drained).await.unwrap();
  first.read_to_end(&mut drained).await.unwrap();
  assert!(drained.is_empty());

  eventually(|| relay.can_take_new_stream()).await;
  assert_eq!(relay.active_streams(), 0);
  relay.open_stream().await.unwrap();
}

#[tokio::test]
async fn peer_hangup_closes_the_session() {
  init_tracing();
  let (relay, peer) = session_with_silent_peer(without_keepalive()).await;
  let mut stream = relay.open_stream().await.unwrap();
  drop(peer);

  tokio::time::timeout(PATIENCE, relay.on_closed())
    .await
    .expect("Session must notice the hangup");
  assert!(relay.is_closed());
  assert!(!relay.can_take_new_stream());
  assert!(relay.open_stream().await.is_err());

  let mut remainder = Vec::new();
  tokio::time::timeout(PATIENCE, stream.read_to_end(&mut remainder))
    .await
    .expect("Open streams must end with the session")
    .ok();
}

#[tokio::test]
async fn close_propagates_to_the_peer() {
  init_tracing();
  let (relay, hidden) = session_pair(without_keepalive()).await;
  relay.close();
  tokio::time::timeout(PATIENCE, relay.on_closed())
    .await
    .expect("Closing resolves on_closed");
  tokio::time::timeout(PATIENCE, hidden.on_closed())
    .await
    .expect("Peer must observe the closed connection");
  assert!(hidden.accept().await.is_none());
}

#[tokio::test]
async fn keepalive_closes_a_silent_session() {
  init_tracing();
  let (relay, _peer) = session_with_silent_peer(MuxConfig {
    keepalive_interval_ms: 10,
    keepalive_timeout_ms: 200,
    ..Default::default()
  })
  .await;
  tokio::time::timeout(PATIENCE, relay.on_closed())
    .await
    .expect("Keepalive must give up on a silent peer");
}

#[tokio::test]
async fn keepalive_sustains_a_responsive_session() {
  init_tracing();
  let (relay, hidden) = session_pair(MuxConfig {
    keepalive_interval_ms: 10,
    keepalive_timeout_ms: 200,
    ..Default::default()
  })
  .await;
  tokio::time::sleep(Duration::from_millis(400)).await;
  assert!(!relay.is_closed());
  assert!(!hidden.is_closed());
}

#[tokio::test]
async fn session_loss_fails_open_streams_instead_of_ending_them() {
  init_tracing();
  let (relay, hidden) = session_pair(without_keepalive()).await;
  let mut stream = relay.open_stream().await.unwrap();
  let mut accepted = hidden.accept().await.expect("Stream must be accepted");
  accepted.write_all(b"partial-respo").await.unwrap();
  let mut received = [0u8; 13];
  stream.read_exact(&mut received).await.unwrap();

  // The hidden side's stream stays open; only its session goes away
  drop(hidden);
  let mut rest = Vec::new();
  let error = tokio::time::timeout(PATIENCE, stream.read_to_end(&mut rest))
    .await
    .expect("Open streams must end with the session")
    .expect_err("A lost session is not a clean end-of-stream");
  assert_eq!(error.kind(), io::ErrorKind::ConnectionReset);
  assert!(rest.is_empty());
  let error = stream.write_all(b"late").await.expect_err("Writes after a reset fail");
  assert_eq!(error.kind(), io::ErrorKind::ConnectionReset);
  drop(accepted);
}

#[tokio::test]
async fn relay_reports_a_truncated_response() {
  init_tracing();
  let (relay_session, hidden) = session_pair(without_keepalive()).await;
  let stream = relay_session.open_stream().await.unwrap();
  let mut accepted = hidden.accept().await.expect("Stream must be accepted");
  let (mut client, client_side) = tokio::io::duplex(1024);
  let relaying = tokio::spawn(forward(client_side, stream));

  accepted.write_all(b"partial-respo").await.unwrap();
  let mut received = [0u8; 13];
  client.read_exact(&mut received).await.unwrap();
  drop(hidden);

  let transferred = tokio::time::timeout(PATIENCE, relaying)
    .await
    .expect("Relay must end with the session")
    .unwrap();
  assert_eq!(transferred.bytes, 13);
  assert!(!transferred.is_clean());
  assert_eq!(
    transferred.error.map(|e| e.kind()),
    Some(io::ErrorKind::ConnectionReset)
  );
  drop(accepted);
}

#[tokio::test]
async fn finished_streams_still_end_cleanly_after_session_loss() {
  init_tracing();
  let (relay, hidden) = session_pair(without_keepalive()).await;
  let mut stream = relay.open_stream().await.unwrap();
  let mut accepted = hidden.accept().await.expect("Stream must be accepted");
  accepted.write_all(b"complete").await.unwrap();
  accepted.shutdown().await.unwrap();
  let mut received = Vec::new();
  stream.read_to_end(&mut received).await.unwrap();
  assert_eq!(received, b"complete");

  drop(hidden);
  tokio::time::timeout(PATIENCE, relay.on_closed())
    .await
    .expect("Session must notice the hangup");
  let mut more = [0u8; 8];
  assert_eq!(
    stream.read(&mut more).await.unwrap(),
    0,
    "A finished peer still reads as end-of-stream"
  );
}

#[tokio::test]
async fn unread_stream_does_not_stall_its_neighbours() {
  init_tracing();
  let (relay, hidden) = session_pair(MuxConfig {
    max_frame_size: 1024,
    stream_buffer_size: 4096,
    keepalive_interval_ms: 10,
    keepalive_timeout_ms: 200,
    ..Default::default()
  })
  .await;
  let _never_read = relay.open_stream().await.unwrap();
  let mut flooding = hidden.accept().await.expect("Stream must be accepted");
  let flood = tokio::spawn(async move {
    let chunk = vec![0x5Au8; 1024];
    while flooding.write_all(&chunk).await.is_ok() {}
  });
  let echo = tokio::spawn(async move {
    while let Some(stream) = hidden.accept().await {
      tokio::spawn(async move {
        let (mut reader, mut writer) = tokio::io::split(stream);
        tokio::io::copy(&mut reader, &mut writer).await.ok();
        writer.shutdown().await.ok();
      });
    }
  });

  tokio::time::sleep(Duration::from_millis(400)).await;
  assert!(!relay.is_closed(), "Keepalive must keep flowing past a full stream");

  let mut neighbour = relay.open_stream().await.unwrap();
  neighbour.write_all(b"still flowing").await.unwrap();
  neighbour.shutdown().await.unwrap();
  let mut echoed = Vec::new();
  tokio::time::timeout(PATIENCE, neighbour.read_to_end(&mut echoed))
    .await
    .expect("Neighbouring streams must keep moving")
    .unwrap();
  assert_eq!(echoed, b"still flowing");
  assert!(!flood.is_finished(), "The unread stream is held back, not failed");

  relay.close();
  flood.abort();
  echo.abort();
}

#[tokio::test]
async fn overrunning_the_window_resets_only_that_stream() {
  init_tracing();
  let (relay, mut peer) = session_with_silent_peer(MuxConfig {
    stream_buffer_size: 1024,
    ..without_keepalive()
  })
  .await;
  let max = MuxConfig::default().max_frame_size;
  write_frame(&mut peer, &Frame::open(2), max).await.unwrap();
  write_frame(&mut peer, &Frame::data(2, vec![0u8; 2048]), max).await.unwrap();
  peer.flush().await.unwrap();

  let mut stream = relay.accept().await.expect("Stream must be accepted");
  let reset = tokio::time::timeout(PATIENCE, async {
    loop {
      let frame = read_frame(&mut peer, max)
        .await
        .unwrap()
        .expect("Connection must stay open");
      if frame.kind == FrameKind::Reset {
        break frame;
      }
    }
  })
  .await
  .expect("Overrunning stream must be reset");
  assert_eq!(reset.stream, 2);

  let mut received = Vec::new();
  let error = stream.read_to_end(&mut received).await.expect_err("Stream was reset");
  assert_eq!(error.kind(), io::ErrorKind::ConnectionReset);
  assert!(!relay.is_closed());
}

#[test]
fn config_fills_missing_fields_with_defaults() {
  let config: MuxConfig =
    serde_json::from_str(r#"{ "max_concurrent_streams": 8, "keepalive_timeout_ms": 0 }"#).unwrap();
  assert_eq!(config.max_concurrent_streams, 8);
  assert_eq!(config.max_frame_size, MuxConfig::default().max_frame_size);
  assert_eq!(config.keepalive(), None);
  assert_eq!(
    MuxConfig::default().keepalive(),
    Some((Duration::from_secs(15), Duration::from_secs(45)))
  );
}
