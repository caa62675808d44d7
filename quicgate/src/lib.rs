// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Tunnels one game connection through a QUIC gateway.
//!
//! A client process opens a [`client::TunnelContext`], which owns a single QUIC endpoint,
//! and from it opens one [`client::TunnelSession`] per intercepted connection. Each session
//! presents a plaintext loopback port (the local bridge) and relays its bytes to a gateway
//! over an authenticated QUIC connection. The [`gateway`] authenticates the session,
//! dials the real destination over TCP and splices the two legs.
//!
//! When the game protocol switches to its stream cipher, the session hands the key to
//! the gateway over the control stream, and the gateway takes over encryption of the
//! destination leg. The loopback leg is never encrypted.

pub mod common;
pub mod util;

pub mod client;
pub mod gateway;
pub mod host;
pub mod transport;

#[cfg(test)]
mod end_to_end;
