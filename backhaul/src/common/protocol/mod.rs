// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Types for reaching hidden nodes over the connections they dial in with
//!
//! Lifetime of a connection, relay side:
//!
//! - an acceptor receives a raw connection and the identity it belongs to
//! - the registry negotiates a transport over it and tracks it by identity
//! - a dispatcher looks the identity up and opens a logical stream
//! - bytes are relayed in both directions until each side half-closes
//! - the transport dies or is removed, and the disconnect notifier fires
//!
//! Identity derivation and authentication happen before any of this.

pub mod address;
pub mod mux;
pub mod negotiation;
pub mod tunnel;
