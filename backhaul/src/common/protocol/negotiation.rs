// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const BACKHAUL_NEGOTIATION_MAGIC: &[u8; 4] = &[0x42, 0x48, 0x4d, 0x58]; // UTF-8 "BHMX"
const LOCAL_PROTOCOL_VERSION: u8 = 0;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationError {
  #[error("Failed to read the peer's preface")]
  ReadError,
  #[error("Failed to write the local preface")]
  WriteError,
  #[error("Peer preface did not carry the expected magic")]
  ProtocolViolation,
  #[error("Peer requested unsupported protocol version {0}")]
  UnsupportedProtocolVersion(u8),
}

/// Exchanges the multiplexer preface over a freshly established link.
///
/// Both sides write their preface before reading the peer's, so the exchange
/// is symmetric and either end may be the one that dialed.
pub async fn negotiate<S>(link: &mut S) -> Result<(), NegotiationError>
where
  S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
  link
    .write_all(BACKHAUL_NEGOTIATION_MAGIC)
    .await
    .map_err(|_| NegotiationError::WriteError)?;
  link
    .write_u8(LOCAL_PROTOCOL_VERSION)
    .await
    .map_err(|_| NegotiationError::WriteError)?;
  link
    .flush()
    .await
    .map_err(|_| NegotiationError::WriteError)?;

  let mut remote_magic = [0u8; 4];
  link
    .read_exact(&mut remote_magic)
    .await
    .map_err(|_| NegotiationError::ReadError)?;
  if &remote_magic != BACKHAUL_NEGOTIATION_MAGIC {
    return Err(NegotiationError::ProtocolViolation);
  }

  let remote_protocol_version = link
    .read_u8()
    .await
    .map_err(|_| NegotiationError::ReadError)?;
  if remote_protocol_version != LOCAL_PROTOCOL_VERSION {
    return Err(NegotiationError::UnsupportedProtocolVersion(
      remote_protocol_version,
    ));
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

  use super::{negotiate, NegotiationError, BACKHAUL_NEGOTIATION_MAGIC};

  #[tokio::test]
  async fn symmetric_negotiation() {
    let (mut a, mut b) = duplex(64);
    let (ra, rb) = futures::future::join(negotiate(&mut a), negotiate(&mut b)).await;
    assert_eq!(ra, Ok(()));
    assert_eq!(rb, Ok(()));
  }

  #[tokio::test]
  async fn wrong_magic_is_a_protocol_violation() {
    let (mut a, mut b) = duplex(64);
    b.write_all(b"HTTP/").await.unwrap();
    assert_eq!(
      negotiate(&mut a).await,
      Err(NegotiationError::ProtocolViolation)
    );
  }

  #[tokio::test]
  async fn newer_version_is_refused() {
    let (mut a, mut b) = duplex(64);
    b.write_all(BACKHAUL_NEGOTIATION_MAGIC).await.unwrap();
    b.write_u8(3).await.unwrap();
    assert_eq!(
      negotiate(&mut a).await,
      Err(NegotiationError::UnsupportedProtocolVersion(3))
    );
    // The local preface must have been written regardless
    let mut written = [0u8; 5];
    b.read_exact(&mut written).await.unwrap();
    assert_eq!(&written[..4], BACKHAUL_NEGOTIATION_MAGIC);
  }

  #[tokio::test]
  async fn peer_hangup_is_a_read_error() {
    let (mut a, b) = duplex(64);
    drop(b);
    // Writes fail first against a dropped peer
    assert_eq!(negotiate(&mut a).await, Err(NegotiationError::WriteError));

    let (mut a, mut b) = duplex(64);
    b.write_all(&BACKHAUL_NEGOTIATION_MAGIC[..2]).await.unwrap();
    b.shutdown().await.unwrap();
    assert_eq!(negotiate(&mut a).await, Err(NegotiationError::ReadError));
  }
}
