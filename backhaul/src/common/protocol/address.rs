// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Mapping between identities and the registry's address key space

use crate::common::identity::{Identity, IdentityParseError};

/// Routing-port marker appended to every encoded identity
pub const ADDRESS_SUFFIX: &str = ":443";

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum AddressDecodeError {
  #[error("Address is missing the {:?} suffix", ADDRESS_SUFFIX)]
  MissingSuffix,
  #[error("Address does not hold a valid identity: {0}")]
  InvalidIdentity(#[from] IdentityParseError),
}

pub fn encode(identity: &Identity) -> String {
  let mut address = identity.to_string();
  address.push_str(ADDRESS_SUFFIX);
  address
}

pub fn try_decode(address: &str) -> Result<Identity, AddressDecodeError> {
  let text = address
    .strip_suffix(ADDRESS_SUFFIX)
    .ok_or(AddressDecodeError::MissingSuffix)?;
  Ok(text.parse()?)
}

/// Inverse of [encode].
///
/// Addresses only ever originate from [encode], so a malformed one is a bug
/// in the caller and panics rather than being reported.
pub fn decode(address: &str) -> Identity {
  match try_decode(address) {
    Ok(identity) => identity,
    Err(e) => panic!(
      "Address {:?} was not produced by the address codec: {}",
      address, e
    ),
  }
}

/// Endpoint under which a dispatcher routes requests toward `identity`
pub fn url(identity: &Identity) -> String {
  format!("https://{}", identity)
}

#[cfg(test)]
mod tests {
  use std::collections::HashSet;

  use rand::RngCore;

  use super::{decode, encode, try_decode, url, AddressDecodeError, ADDRESS_SUFFIX};
  use crate::common::Identity;

  fn random_identity() -> Identity {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    Identity::new(bytes)
  }

  #[test]
  fn encode_decode_roundtrip() {
    let mut seen = HashSet::new();
    for _ in 0..256 {
      let identity = random_identity();
      let address = encode(&identity);
      assert!(address.ends_with(ADDRESS_SUFFIX));
      assert_eq!(decode(&address), identity);
      seen.insert(address);
    }
    assert_eq!(seen.len(), 256, "Distinct identities must not share an address");
    let zero = Identity::new([0; 32]);
    let one = Identity::new([1; 32]);
    assert_ne!(encode(&zero), encode(&one));
  }

  #[test]
  fn try_decode_reports_malformed_addresses() {
    let identity = random_identity();
    assert_eq!(
      try_decode(&identity.to_string()),
      Err(AddressDecodeError::MissingSuffix)
    );
    assert!(matches!(
      try_decode("nothex:443"),
      Err(AddressDecodeError::InvalidIdentity(_))
    ));
  }

  #[test]
  #[should_panic(expected = "not produced by the address codec")]
  fn decode_panics_on_foreign_addresses() {
    decode("example.com:80");
  }

  #[test]
  fn url_is_https_identity() {
    let identity = Identity::new([0xAB; 32]);
    assert_eq!(url(&identity), format!("https://{}", "AB".repeat(32)));
    assert_eq!(url(&identity), url(&identity));
  }
}
