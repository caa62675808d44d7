// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use super::bridge::{self, KeyInstallRequest};
use super::{SessionError, StateError};
use crate::common::address::TunnelTarget;
use crate::common::id::SessionId;
use crate::common::protocol::close_codes;
use crate::common::protocol::control::{ConnectTo, ControlChannel, Reply};
use crate::common::{CipherKey, HostAndPort};
use crate::transport::{self, ContextConfig};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SessionState {
  /// Connect exchange done and bridge listening, but no byte relayed yet
  Opening,
  Bridging,
  Closed,
}

struct KeyRelay {
  cipher_key: Option<CipherKey>,
  requests: mpsc::Sender<KeyInstallRequest>,
}

/// One tunneled connection: a loopback listener on the client bridged to a gateway stream
pub struct TunnelSession {
  id: SessionId,
  local_port: u16,
  destination: HostAndPort,
  gateway: SocketAddr,
  state: watch::Receiver<SessionState>,
  encryption_enabled: AtomicBool,
  key_relay: tokio::sync::Mutex<KeyRelay>,
  cancellation: CancellationToken,
  driver: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for TunnelSession {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TunnelSession")
      .field("id", &self.id)
      .field("local_port", &self.local_port)
      .field("destination", &self.destination)
      .field("gateway", &self.gateway)
      .field("state", &self.state())
      .field("encryption_enabled", &self.is_encryption_enabled())
      .finish()
  }
}

impl TunnelSession {
  /// Connects to the gateway, waits for it to reach the destination, then starts the bridge
  ///
  /// Returns once the bridge is listening; relaying begins when the host connects to it.
  pub(super) async fn open(
    id: SessionId,
    endpoint: &quinn::Endpoint,
    client_config: quinn::ClientConfig,
    target: TunnelTarget,
    destination: HostAndPort,
    config: &ContextConfig,
    cancellation: CancellationToken,
  ) -> Result<Arc<Self>, SessionError> {
    let connection = transport::connect(
      endpoint,
      client_config,
      &target.gateway,
      config.connect_timeout,
    )
    .await?;
    let request = ConnectTo {
      auth_key: target.auth_key,
      destination: destination.clone(),
    };
    let handshake = async {
      let (send, recv) = connection.open_bi().await?;
      let mut control = ControlChannel::new(send, recv);
      control.send_connect(&request).await?;
      control.expect_reply(Reply::ConnectAcknowledged).await?;
      Ok::<_, SessionError>(control)
    };
    let control = match tokio::time::timeout(config.handshake_timeout, handshake).await {
      Ok(Ok(control)) => control,
      Ok(Err(error)) => {
        let error = SessionError::from_gateway(&connection, error);
        transport::close(&connection, close_codes::NORMAL, "connect request failed");
        return Err(error);
      }
      Err(_elapsed) => {
        transport::close(&connection, close_codes::NORMAL, "connect request timed out");
        return Err(SessionError::Timeout);
      }
    };

    let bridge_listener = async {
      let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
      let port = listener.local_addr()?.port();
      Ok::<_, std::io::Error>((listener, port))
    };
    let (listener, local_port) = match bridge_listener.await {
      Ok(bound) => bound,
      Err(error) => {
        transport::close(&connection, close_codes::NORMAL, "local bridge unavailable");
        return Err(SessionError::Bridge(error));
      }
    };

    let (state_sender, state) = watch::channel(SessionState::Opening);
    let (requests, key_requests) = mpsc::channel(1);
    let gateway_address = connection.remote_address();
    let span = tracing::info_span!(
      "session",
      id = %id,
      local_port,
      destination = %destination,
      gateway = %gateway_address,
    );
    tracing::info!(parent: &span, "Tunnel session opened");
    let driver = tokio::task::spawn(
      bridge::drive(
        connection,
        control,
        listener,
        key_requests,
        state_sender,
        config.handshake_timeout,
        cancellation.clone(),
      )
      .instrument(span),
    );

    Ok(Arc::new(Self {
      id,
      local_port,
      destination,
      gateway: gateway_address,
      state,
      encryption_enabled: AtomicBool::new(false),
      key_relay: tokio::sync::Mutex::new(KeyRelay {
        cipher_key: None,
        requests,
      }),
      cancellation,
      driver: std::sync::Mutex::new(Some(driver)),
    }))
  }

  pub fn id(&self) -> SessionId {
    self.id
  }

  /// Port on 127.0.0.1 the host should connect to in place of the destination
  pub fn local_port(&self) -> u16 {
    self.local_port
  }

  pub fn destination(&self) -> &HostAndPort {
    &self.destination
  }

  pub fn gateway_address(&self) -> SocketAddr {
    self.gateway
  }

  pub fn state(&self) -> SessionState {
    *self.state.borrow()
  }

  pub fn is_encryption_enabled(&self) -> bool {
    self.encryption_enabled.load(Ordering::Acquire)
  }

  /// Resolves once the session has closed for any reason
  pub async fn closed(&self) {
    let mut state = self.state.clone();
    while *state.borrow_and_update() != SessionState::Closed {
      if state.changed().await.is_err() {
        break;
      }
    }
  }

  /// Hands `key` to the gateway, which encrypts the destination leg from this point onward
  ///
  /// Bytes the host wrote to the bridge before this call are delivered in cleartext; bytes
  /// written after it returns are encrypted. The key is fixed for the rest of the session.
  pub async fn enable_encryption(&self, key: CipherKey) -> Result<(), StateError> {
    let mut relay = self.key_relay.lock().await;
    if self.state() == SessionState::Closed {
      return Err(StateError::Closed);
    }
    if relay.cipher_key.is_some() {
      return Err(StateError::EncryptionAlreadyEnabled);
    }
    let (installed, installation) = oneshot::channel();
    relay
      .requests
      .send(KeyInstallRequest { key, installed })
      .await
      .map_err(|_| StateError::Closed)?;
    installation.await.map_err(|_| StateError::Closed)?;
    relay.cipher_key = Some(key);
    self.encryption_enabled.store(true, Ordering::Release);
    Ok(())
  }

  /// Stops the bridge and closes the gateway connection; repeated calls are no-ops
  pub async fn close(&self) {
    self.cancellation.cancel();
    let driver = self
      .driver
      .lock()
      .unwrap_or_else(std::sync::PoisonError::into_inner)
      .take();
    if let Some(driver) = driver {
      if let Err(error) = driver.await {
        tracing::error!(id = %self.id, ?error, "Session driver terminated abnormally");
      }
    }
    self.closed().await;
  }
}
