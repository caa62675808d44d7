// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Wire protocol between tunnel clients and gateways
//!
//! Each tunnel is one QUIC connection carrying exactly two client-opened bidirectional streams:
//! the control stream first, then the data stream. The data stream begins with
//! [`DATA_STREAM_PREAMBLE`] and thereafter carries the relayed bytes verbatim.
pub mod control;

/// First byte the client writes on the data stream
pub const DATA_STREAM_PREAMBLE: u8 = 0xD7;

/// QUIC application close codes used by gateways to explain why a tunnel ended
pub mod close_codes {
  pub const NORMAL: u32 = 0;
  pub const PROTOCOL_VIOLATION: u32 = 1;
  /// Authentication failed or the request was refused; intentionally unspecific
  pub const REJECTED: u32 = 2;
  pub const DESTINATION_UNREACHABLE: u32 = 3;
  pub const RELAY_FAILED: u32 = 4;
  pub const SHUTDOWN: u32 = 5;

  pub fn describe(code: u64) -> &'static str {
    match code {
      c if c == NORMAL as u64 => "normal",
      c if c == PROTOCOL_VIOLATION as u64 => "protocol violation",
      c if c == REJECTED as u64 => "rejected",
      c if c == DESTINATION_UNREACHABLE as u64 => "destination unreachable",
      c if c == RELAY_FAILED as u64 => "relay failed",
      c if c == SHUTDOWN as u64 => "shutdown",
      _ => "unknown",
    }
  }
}
