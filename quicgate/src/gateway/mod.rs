// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Gateway acceptor
//!
//! Every inbound QUIC connection carries one tunnel. The gateway reads the connect request,
//! authenticates it before touching the network on the client's behalf, dials the destination
//! and hands both legs to a [`relay::RelayPump`].
mod connection;
pub mod relay;

pub use connection::{GatewayConnection, GatewayError};

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use crate::common::authentication::AuthenticationPolicy;
use crate::common::id::MonotonicAtomicGenerator;
use crate::common::protocol::close_codes;
use crate::transport::{self, GatewayConfig, TransportError};

pub struct Gateway {
  endpoint: quinn::Endpoint,
  policy: Arc<dyn AuthenticationPolicy>,
  config: Arc<GatewayConfig>,
  connection_ids: MonotonicAtomicGenerator,
}

impl std::fmt::Debug for Gateway {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Gateway")
      .field("local_addr", &self.endpoint.local_addr().ok())
      .field("policy", &self.policy)
      .field("config", &self.config)
      .finish()
  }
}

impl Gateway {
  /// Binds the listening endpoint at `config.bind_address`; must be called within a Tokio runtime
  pub fn bind(
    server_config: quinn::ServerConfig,
    config: GatewayConfig,
    policy: Arc<dyn AuthenticationPolicy>,
  ) -> Result<Self, TransportError> {
    let endpoint = transport::bind_server_endpoint(server_config, config.bind_address)?;
    Ok(Self {
      endpoint,
      policy,
      config: Arc::new(config),
      connection_ids: MonotonicAtomicGenerator::default(),
    })
  }

  pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
    self.endpoint.local_addr()
  }

  /// Accepts tunnels until `shutdown` fires, then closes every live tunnel and waits for them
  #[tracing::instrument(name = "gateway", skip_all, fields(addr = ?self.endpoint.local_addr().ok()))]
  pub async fn run(self, shutdown: CancellationToken) {
    let mut tunnels = JoinSet::new();
    tracing::info!("Gateway accepting tunnels");
    loop {
      tokio::select! {
        _ = shutdown.cancelled() => break,
        incoming = self.endpoint.accept() => match incoming {
          Some(connecting) => {
            let id = self.connection_ids.next_raw();
            let span = tracing::info_span!(
              "gateway_connection",
              id,
              remote = %connecting.remote_address(),
            );
            tunnels.spawn(
              connection::serve(
                id,
                connecting,
                self.policy.clone(),
                self.config.clone(),
                shutdown.child_token(),
              )
              .instrument(span),
            );
          }
          None => break,
        },
        Some(finished) = tunnels.join_next(), if !tunnels.is_empty() => {
          if let Err(error) = finished {
            tracing::error!(?error, "Tunnel task terminated abnormally");
          }
        }
      }
    }
    tracing::info!(live_tunnels = tunnels.len(), "Gateway shutting down");
    self.endpoint.close(
      quinn::VarInt::from_u32(close_codes::SHUTDOWN),
      b"shutting down",
    );
    while tunnels.join_next().await.is_some() {}
    self.endpoint.wait_idle().await;
  }
}
