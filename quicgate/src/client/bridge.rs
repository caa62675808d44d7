// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Local bridge: splices one loopback TCP connection with the tunnel's data stream
//!
//! The uplink direction also owns the control stream after the connect exchange, so key
//! installation is sequenced against the bytes it has forwarded. Before sending a key, the
//! uplink forwards everything the host wrote up to that moment, reports that byte count as the
//! key's offset, and resumes forwarding only once the gateway acknowledges the key.
use std::io::Read;
use std::time::Duration;

use quinn::{RecvStream, SendStream};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use super::session::SessionState;
use crate::common::cipher::CipherKey;
use crate::common::protocol::close_codes;
use crate::common::protocol::control::{ControlChannel, ControlError, KeyUpdate, Reply};
use crate::common::protocol::DATA_STREAM_PREAMBLE;
use crate::transport;
use crate::util::{FINISH_LINGER, RELAY_BUFFER_SIZE};

pub(super) type SessionControl = ControlChannel<SendStream, RecvStream>;

pub(super) struct KeyInstallRequest {
  pub key: CipherKey,
  pub installed: oneshot::Sender<()>,
}

#[derive(thiserror::Error, Debug)]
pub(super) enum BridgeError {
  #[error("Local bridge I/O failed")]
  Local(#[from] std::io::Error),
  #[error("Writing to the gateway failed")]
  Write(#[from] quinn::WriteError),
  #[error("Reading from the gateway failed")]
  Read(#[from] quinn::ReadError),
  #[error("Gateway connection lost")]
  Connection(#[from] quinn::ConnectionError),
  #[error("Key relay failed")]
  Control(#[from] ControlError),
  #[error("Gateway did not acknowledge the cipher key in time")]
  KeyAckTimeout,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum BridgeEnd {
  Cancelled,
  /// The session was released before the host ever connected
  Released,
  HostFinished,
  GatewayFinished,
}

/// Runs a session until cancellation or either leg ends, then closes the gateway connection
pub(super) async fn drive(
  connection: quinn::Connection,
  mut control: SessionControl,
  listener: TcpListener,
  mut key_requests: mpsc::Receiver<KeyInstallRequest>,
  state: watch::Sender<SessionState>,
  key_ack_timeout: Duration,
  cancellation: CancellationToken,
) {
  let outcome = tokio::select! {
    _ = cancellation.cancelled() => Ok(BridgeEnd::Cancelled),
    result = bridge(
      &connection,
      &mut control,
      listener,
      &mut key_requests,
      &state,
      key_ack_timeout,
    ) => result,
  };
  match outcome {
    Ok(end) => {
      tracing::debug!(?end, "Session finished");
      transport::close(&connection, close_codes::NORMAL, "session closed");
    }
    Err(error) => {
      let error = anyhow::Error::from(error);
      match transport::application_close(&connection) {
        Some((code, reason)) => tracing::info!(
          code,
          meaning = close_codes::describe(code),
          %reason,
          "Gateway ended the session"
        ),
        None => tracing::warn!(error = ?error, "Session failed"),
      }
      transport::close(&connection, close_codes::RELAY_FAILED, "bridge failed");
    }
  }
  state.send_replace(SessionState::Closed);
}

async fn bridge(
  connection: &quinn::Connection,
  control: &mut SessionControl,
  listener: TcpListener,
  key_requests: &mut mpsc::Receiver<KeyInstallRequest>,
  state: &watch::Sender<SessionState>,
  key_ack_timeout: Duration,
) -> Result<BridgeEnd, BridgeError> {
  let mut early_key = None;
  let local = loop {
    tokio::select! {
      biased;
      accepted = listener.accept() => {
        let (stream, peer) = accepted?;
        tracing::debug!(%peer, "Host connected to local bridge");
        break stream;
      }
      request = key_requests.recv() => match request {
        Some(request) => {
          // Nothing has been forwarded yet, so the key covers the whole stream
          early_key = Some(request.key);
          let _ = request.installed.send(());
        }
        None => return Ok(BridgeEnd::Released),
      },
      error = connection.closed() => return Err(error.into()),
    }
  };
  drop(listener);
  local.set_nodelay(true)?;

  let (mut data_send, data_recv) = connection.open_bi().await?;
  data_send.write_all(&[DATA_STREAM_PREAMBLE]).await?;
  if let Some(key) = early_key {
    install_key(control, key, 0, key_ack_timeout).await?;
  }

  let (local_read, local_write) = local.into_split();
  let end = tokio::select! {
    result = uplink(local_read, data_send, control, key_requests, state, key_ack_timeout) =>
      result,
    result = downlink(data_recv, local_write, state) => result,
  }?;
  if end == BridgeEnd::HostFinished {
    // The gateway closes once the destination has the host's final bytes
    let _ = tokio::time::timeout(FINISH_LINGER, connection.closed()).await;
  }
  Ok(end)
}

async fn install_key(
  control: &mut SessionControl,
  key: CipherKey,
  uplink_offset: u64,
  ack_timeout: Duration,
) -> Result<(), BridgeError> {
  tracing::debug!(uplink_offset, "Relaying cipher key to gateway");
  control
    .send_key_update(&KeyUpdate { key, uplink_offset })
    .await?;
  // Keep-alives defeat the idle timeout, so the ack wait needs its own bound
  tokio::time::timeout(
    ack_timeout,
    control.expect_reply(Reply::KeyUpdateAcknowledged),
  )
  .await
  .map_err(|_| BridgeError::KeyAckTimeout)??;
  Ok(())
}

fn mark_bridging(state: &watch::Sender<SessionState>) {
  state.send_if_modified(|current| {
    if *current == SessionState::Opening {
      *current = SessionState::Bridging;
      true
    } else {
      false
    }
  });
}

async fn uplink(
  mut local: OwnedReadHalf,
  mut remote: SendStream,
  control: &mut SessionControl,
  key_requests: &mut mpsc::Receiver<KeyInstallRequest>,
  state: &watch::Sender<SessionState>,
  key_ack_timeout: Duration,
) -> Result<BridgeEnd, BridgeError> {
  let mut buffer = vec![0u8; RELAY_BUFFER_SIZE];
  let mut forwarded: u64 = 0;
  let mut accepting_keys = true;
  loop {
    tokio::select! {
      biased;
      request = key_requests.recv(), if accepting_keys => match request {
        Some(request) => {
          let host_finished =
            forward_already_written(&local, &mut remote, &mut buffer, &mut forwarded, state).await?;
          install_key(control, request.key, forwarded, key_ack_timeout).await?;
          let _ = request.installed.send(());
          if host_finished {
            transport::finish_stream(&mut remote).await?;
            return Ok(BridgeEnd::HostFinished);
          }
        }
        None => accepting_keys = false,
      },
      read = local.read(&mut buffer) => {
        let count = read?;
        if count == 0 {
          transport::finish_stream(&mut remote).await?;
          return Ok(BridgeEnd::HostFinished);
        }
        mark_bridging(state);
        remote.write_all(&buffer[..count]).await?;
        forwarded += count as u64;
      }
    }
  }
}

/// Forwards whatever the host has already written without waiting for more
///
/// Reads the socket directly so that bytes queued by the kernel are seen even before the
/// runtime has observed readiness. Returns true if the host has closed its side.
async fn forward_already_written(
  local: &OwnedReadHalf,
  remote: &mut SendStream,
  buffer: &mut [u8],
  forwarded: &mut u64,
  state: &watch::Sender<SessionState>,
) -> Result<bool, BridgeError> {
  loop {
    let read = {
      let socket = socket2::SockRef::from(local.as_ref());
      (&*socket).read(buffer)
    };
    match read {
      Ok(0) => return Ok(true),
      Ok(count) => {
        mark_bridging(state);
        remote.write_all(&buffer[..count]).await?;
        *forwarded += count as u64;
      }
      Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(false),
      Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
      Err(e) => return Err(e.into()),
    }
  }
}

async fn downlink(
  mut remote: RecvStream,
  mut local: OwnedWriteHalf,
  state: &watch::Sender<SessionState>,
) -> Result<BridgeEnd, BridgeError> {
  let mut buffer = vec![0u8; RELAY_BUFFER_SIZE];
  loop {
    match remote.read(&mut buffer).await? {
      Some(count) => {
        mark_bridging(state);
        local.write_all(&buffer[..count]).await?;
      }
      None => {
        local.shutdown().await?;
        return Ok(BridgeEnd::GatewayFinished);
      }
    }
  }
}
