// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use quinn::{RecvStream, SendStream};
use tokio::net::TcpStream;

use super::relay::{KeyOrderError, KeyState, RelayEnd, RelayError, RelayPump, SharedKeyState};
use crate::common::authentication::{AuthError, AuthenticationPolicy};
use crate::common::protocol::close_codes;
use crate::common::protocol::control::{ControlChannel, ControlError, Reply};
use crate::common::protocol::DATA_STREAM_PREAMBLE;
use crate::common::{AuthKey, HostAndPort};
use crate::transport::GatewayConfig;
use crate::util::FINISH_LINGER;

type GatewayControl = ControlChannel<SendStream, RecvStream>;

#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
  #[error("Client connection failed")]
  Connection(#[from] quinn::ConnectionError),
  #[error("Timed out waiting for the client")]
  Timeout,
  #[error("Control stream failed")]
  Control(#[from] ControlError),
  #[error(transparent)]
  Auth(#[from] AuthError),
  #[error("Could not reach destination {destination}")]
  Dial {
    destination: String,
    #[source]
    error: std::io::Error,
  },
  #[error("Dialing destination {0} timed out")]
  DialTimeout(String),
  #[error("Reading the data stream preamble failed")]
  Preamble(#[from] quinn::ReadExactError),
  #[error("Data stream began with {0:#04x} instead of the preamble")]
  BadPreamble(u8),
  #[error(transparent)]
  KeyOrder(#[from] KeyOrderError),
  #[error(transparent)]
  Relay(#[from] RelayError),
  #[error("Gateway is shutting down")]
  Shutdown,
}

impl GatewayError {
  /// Close code reported to the client; authentication failures never say more than "rejected"
  pub fn close_code(&self) -> u32 {
    match self {
      GatewayError::Auth(_) => close_codes::REJECTED,
      GatewayError::Dial { .. } | GatewayError::DialTimeout(_) => {
        close_codes::DESTINATION_UNREACHABLE
      }
      GatewayError::Relay(_) => close_codes::RELAY_FAILED,
      GatewayError::Shutdown => close_codes::SHUTDOWN,
      GatewayError::Connection(_)
      | GatewayError::Timeout
      | GatewayError::Control(_)
      | GatewayError::Preamble(_)
      | GatewayError::BadPreamble(_)
      | GatewayError::KeyOrder(_) => close_codes::PROTOCOL_VIOLATION,
    }
  }

  fn close_reason(&self) -> &'static str {
    match self.close_code() {
      close_codes::REJECTED => "rejected",
      close_codes::DESTINATION_UNREACHABLE => "destination unreachable",
      close_codes::RELAY_FAILED => "relay failed",
      close_codes::SHUTDOWN => "shutting down",
      _ => "protocol violation",
    }
  }
}

/// Gateway-side state of one tunnel
pub struct GatewayConnection {
  id: u64,
  connection: quinn::Connection,
  destination: Option<HostAndPort>,
  authenticated: bool,
  keys: SharedKeyState,
}

impl GatewayConnection {
  pub fn new(id: u64, connection: quinn::Connection) -> Self {
    Self {
      id,
      connection,
      destination: None,
      authenticated: false,
      keys: Arc::new(Mutex::new(KeyState::default())),
    }
  }

  pub fn id(&self) -> u64 {
    self.id
  }

  pub fn destination(&self) -> Option<&HostAndPort> {
    self.destination.as_ref()
  }

  pub fn is_authenticated(&self) -> bool {
    self.authenticated
  }

  /// Authenticates, dials, then relays until either leg ends
  pub async fn run(
    &mut self,
    policy: Arc<dyn AuthenticationPolicy>,
    config: &GatewayConfig,
  ) -> Result<RelayEnd, GatewayError> {
    let (send, recv) = tokio::time::timeout(config.handshake_timeout, self.connection.accept_bi())
      .await
      .map_err(|_| GatewayError::Timeout)??;
    let mut control = ControlChannel::new(send, recv);
    let request = tokio::time::timeout(config.handshake_timeout, control.receive_connect())
      .await
      .map_err(|_| GatewayError::Timeout)??;

    if let Err(error) = authenticate(policy, request.auth_key.clone()).await {
      tracing::warn!("Rejected tunnel request");
      return Err(error.into());
    }
    self.authenticated = true;
    tracing::debug!(destination = %request.destination, "Tunnel request authenticated");
    let destination = dial(&request.destination, config.dial_timeout).await?;
    self.destination = Some(request.destination);
    control.send_reply(Reply::ConnectAcknowledged).await?;
    tracing::info!(destination = ?self.destination, "Tunnel established");

    let control_loop = serve_control(control, self.keys.clone());
    let keys = self.keys.clone();
    let connection = &self.connection;
    let relay = async move {
      let (data_send, mut data_recv) = connection.accept_bi().await?;
      let mut preamble = [0u8; 1];
      data_recv.read_exact(&mut preamble).await?;
      if preamble[0] != DATA_STREAM_PREAMBLE {
        return Err(GatewayError::BadPreamble(preamble[0]));
      }
      tracing::debug!("Data stream opened");
      let end = RelayPump::new(keys)
        .run(data_send, data_recv, destination)
        .await?;
      Ok::<_, GatewayError>(end)
    };
    tokio::pin!(control_loop);
    tokio::pin!(relay);
    tokio::select! {
      result = &mut relay => result,
      result = &mut control_loop => match result {
        Ok(()) => relay.await,
        Err(error) => Err(error),
      },
    }
  }
}

/// Runs the policy on the blocking pool; verifying a password hash is CPU-bound
async fn authenticate(
  policy: Arc<dyn AuthenticationPolicy>,
  key: AuthKey,
) -> Result<(), AuthError> {
  match tokio::task::spawn_blocking(move || policy.authenticate(&key)).await {
    Ok(result) => result,
    Err(error) => {
      tracing::error!(?error, "Authentication policy failed to complete");
      Err(AuthError::Rejected)
    }
  }
}

async fn dial(destination: &HostAndPort, timeout: Duration) -> Result<TcpStream, GatewayError> {
  let dial_error = |error| GatewayError::Dial {
    destination: destination.to_string(),
    error,
  };
  let stream = tokio::time::timeout(
    timeout,
    TcpStream::connect((destination.host(), destination.port())),
  )
  .await
  .map_err(|_| GatewayError::DialTimeout(destination.to_string()))?
  .map_err(dial_error)?;
  stream.set_nodelay(true).map_err(dial_error)?;
  Ok(stream)
}

/// Applies key updates until the client finishes the control stream
async fn serve_control(
  mut control: GatewayControl,
  keys: SharedKeyState,
) -> Result<(), GatewayError> {
  while let Some(update) = control.receive_key_update().await? {
    keys
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .install(&update)?;
    tracing::debug!(uplink_offset = update.uplink_offset, "Cipher key installed");
    control.send_reply(Reply::KeyUpdateAcknowledged).await?;
  }
  Ok(())
}

/// Drives one accepted connection to completion and closes it with an explanatory code
pub(super) async fn serve(
  id: u64,
  connecting: quinn::Connecting,
  policy: Arc<dyn AuthenticationPolicy>,
  config: Arc<GatewayConfig>,
  shutdown: tokio_util::sync::CancellationToken,
) {
  let connection = match tokio::time::timeout(config.handshake_timeout, connecting).await {
    Ok(Ok(connection)) => connection,
    Ok(Err(error)) => {
      tracing::debug!(?error, "Handshake failed");
      return;
    }
    Err(_elapsed) => {
      tracing::debug!("Handshake timed out");
      return;
    }
  };
  let mut tunnel = GatewayConnection::new(id, connection.clone());
  let result = tokio::select! {
    _ = shutdown.cancelled() => Err(GatewayError::Shutdown),
    result = tunnel.run(policy, &config) => result,
  };
  match result {
    Ok(end) => {
      tracing::info!(?end, "Tunnel finished");
      if end == RelayEnd::DestinationFinished {
        // The client closes once the host has the destination's final bytes
        let _ = tokio::time::timeout(FINISH_LINGER, connection.closed()).await;
      }
      crate::transport::close(&connection, close_codes::NORMAL, "relay finished");
    }
    Err(error) => {
      if let Some(reason) = connection.close_reason() {
        tracing::debug!(?reason, "Client closed the tunnel");
      } else {
        match &error {
          GatewayError::Relay(_) | GatewayError::Shutdown => {
            tracing::info!(error = %error_chain(&error), "Tunnel ended")
          }
          _ => tracing::warn!(
            error = %error_chain(&error),
            authenticated = tunnel.is_authenticated(),
            "Tunnel failed"
          ),
        }
        crate::transport::close(&connection, error.close_code(), error.close_reason());
      }
    }
  }
}

fn error_chain(error: &GatewayError) -> String {
  let mut rendered = error.to_string();
  let mut source = std::error::Error::source(error);
  while let Some(cause) = source {
    rendered.push_str(": ");
    rendered.push_str(&cause.to_string());
    source = cause.source();
  }
  rendered
}
