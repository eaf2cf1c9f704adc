// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod relay;

pub use relay::{relay, relay_bidirectional, RelayDestination, RelaySource, Transferred};
