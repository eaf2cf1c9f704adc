// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Connection registry and stream relay for reverse tunnels
//!
//! A hidden node dials out to a relay and keeps that connection open as a
//! multiplexed transport. The relay tracks one live transport per [Identity]
//! in a [ConnectionRegistry], opens logical streams over it on demand, and
//! moves bytes through those streams with [relay](util::relay::relay).
#![warn(unused_imports)]

pub mod common;
pub mod util;

pub use common::{
  protocol::tunnel::registry::{ConnectionRegistry, DisconnectNotifier, RegistryError},
  Identity,
};

#[cfg(test)]
pub(crate) mod test_support {
  /// Routes `tracing` output to the test harness; safe to call from every test
  pub fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
      .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("backhaul=debug"));
    tracing_subscriber::fmt()
      .with_env_filter(env_filter)
      .with_test_writer()
      .try_init()
      .ok();
  }
}
