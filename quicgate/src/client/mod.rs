// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Client half of the tunnel: one [`TunnelContext`] per endpoint, one [`TunnelSession`] per
//! intercepted connection
mod bridge;
mod context;
mod session;

pub use context::TunnelContext;
pub use session::{SessionState, TunnelSession};

use crate::common::protocol::{close_codes, control::ControlError};
use crate::transport::DialError;

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
  #[error("Address does not name a gateway")]
  NotTunneled,
  #[error("Tunnel context is closed")]
  ContextClosed,
  #[error(transparent)]
  Dial(#[from] DialError),
  #[error("Gateway rejected the tunnel request")]
  Rejected,
  #[error("Gateway could not reach the destination")]
  DestinationUnreachable,
  #[error("Gateway closed the tunnel with code {code}: {reason}")]
  GatewayClosed { code: u64, reason: String },
  #[error("Gateway connection lost")]
  ConnectionLost(#[from] quinn::ConnectionError),
  #[error("Control exchange with the gateway failed")]
  Control(#[from] ControlError),
  #[error("Gateway did not acknowledge the tunnel request in time")]
  Timeout,
  #[error("Failed to start the local bridge")]
  Bridge(#[source] std::io::Error),
}

impl SessionError {
  /// Prefers the gateway's stated close code over whatever local failure it caused
  pub(crate) fn from_gateway(connection: &quinn::Connection, fallback: SessionError) -> Self {
    match crate::transport::application_close(connection) {
      Some((code, _)) if code == close_codes::REJECTED as u64 => SessionError::Rejected,
      Some((code, _)) if code == close_codes::DESTINATION_UNREACHABLE as u64 => {
        SessionError::DestinationUnreachable
      }
      Some((code, reason)) => SessionError::GatewayClosed { code, reason },
      None => fallback,
    }
  }
}

/// Misuse of a session; never worth retrying
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateError {
  #[error("Session is closed")]
  Closed,
  #[error("Encryption is already enabled for this session")]
  EncryptionAlreadyEnabled,
}
