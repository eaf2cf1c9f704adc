// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::common::Identity;

/// Observer told about every identity leaving a [ConnectionRegistry](super::ConnectionRegistry).
///
/// Called exactly once per removal, whatever caused it, while the registry
/// still holds its write lock. Notices are therefore ordered with respect to
/// re-registration of the same identity. Implementations must return promptly
/// and must not call back into the registry, which would deadlock.
#[cfg_attr(test, mockall::automock)]
pub trait DisconnectNotifier: Send + Sync + 'static {
  fn on_disconnect(&self, identity: &Identity);
}

impl<F> DisconnectNotifier for F
where
  F: Fn(&Identity) + Send + Sync + 'static,
{
  fn on_disconnect(&self, identity: &Identity) {
    self(identity)
  }
}

/// Forwards disconnects into a channel, for consumers that handle them on their own task
#[derive(Debug, Clone)]
pub struct DisconnectEvents {
  sender: UnboundedSender<Identity>,
}

impl DisconnectEvents {
  pub fn channel() -> (DisconnectEvents, UnboundedReceiver<Identity>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (Self { sender }, receiver)
  }
}

impl DisconnectNotifier for DisconnectEvents {
  fn on_disconnect(&self, identity: &Identity) {
    if self.sender.send(*identity).is_err() {
      tracing::debug!(%identity, "Disconnect receiver dropped; event discarded");
    }
  }
}
