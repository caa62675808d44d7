// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod framed;
pub mod validators;

/// ALPN protocol identifier negotiated by tunnel clients and gateways
pub const ALPN_QUICGATE_1: &[u8] = b"quicgate-1";

/// Size of a single relay read; the splice never buffers more than one of these per direction
pub const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// How long the side that finished a tunnel's data stream waits for its peer to close the
/// connection, so that bytes already in flight reach the far end
pub const FINISH_LINGER: std::time::Duration = std::time::Duration::from_secs(2);
