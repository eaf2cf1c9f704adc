// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod identity;
pub mod protocol;

pub use identity::{Identity, IdentityParseError};
