// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::str::FromStr;

use serde::{Deserializer, Serializer};

/// Number of bytes in an [Identity]
pub const IDENTITY_LENGTH: usize = 32;

/// Opaque name of one hidden node, typically a certificate fingerprint.
///
/// Equality and ordering are byte-wise. The canonical text form is 64
/// uppercase hexadecimal digits; parsing accepts either case.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Identity([u8; IDENTITY_LENGTH]);

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum IdentityParseError {
  #[error("Identity must be {expected} bytes long, received {received}")]
  InvalidLength { expected: usize, received: usize },
  #[error("Invalid hexadecimal identity: {0}")]
  InvalidHex(#[from] hex::FromHexError),
}

impl Identity {
  pub const fn new(bytes: [u8; IDENTITY_LENGTH]) -> Identity {
    Self(bytes)
  }

  pub fn from_slice(bytes: &[u8]) -> Result<Identity, IdentityParseError> {
    let fixed = <[u8; IDENTITY_LENGTH]>::try_from(bytes).map_err(|_| {
      IdentityParseError::InvalidLength {
        expected: IDENTITY_LENGTH,
        received: bytes.len(),
      }
    })?;
    Ok(Self(fixed))
  }

  pub fn as_bytes(&self) -> &[u8; IDENTITY_LENGTH] {
    &self.0
  }

  pub fn into_bytes(self) -> [u8; IDENTITY_LENGTH] {
    self.0
  }
}

impl From<[u8; IDENTITY_LENGTH]> for Identity {
  fn from(bytes: [u8; IDENTITY_LENGTH]) -> Self {
    Self::new(bytes)
  }
}

impl AsRef<[u8]> for Identity {
  fn as_ref(&self) -> &[u8] {
    &self.0
  }
}

impl std::fmt::Display for Identity {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&hex::encode_upper(self.0))
  }
}

impl std::fmt::Debug for Identity {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("Identity")
      .field(&format_args!("{}", self))
      .finish()
  }
}

impl FromStr for Identity {
  type Err = IdentityParseError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    if s.len() != IDENTITY_LENGTH * 2 {
      return Err(IdentityParseError::InvalidLength {
        expected: IDENTITY_LENGTH,
        received: s.len() / 2,
      });
    }
    let mut bytes = [0u8; IDENTITY_LENGTH];
    hex::decode_to_slice(s, &mut bytes)?;
    Ok(Self(bytes))
  }
}

impl serde::Serialize for Identity {
  fn serialize<S>(&self, serializer: S) -> Result<<S as Serializer>::Ok, <S as Serializer>::Error>
  where
    S: Serializer,
  {
    serializer.collect_str(self)
  }
}

impl<'de> serde::de::Deserialize<'de> for Identity {
  fn deserialize<D>(deserializer: D) -> Result<Self, <D as Deserializer<'de>>::Error>
  where
    D: Deserializer<'de>,
  {
    let s: String = serde::Deserialize::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
  }
}
