// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use super::{SessionError, TunnelSession};
use crate::common::address::{AddressDescriptor, TunnelTarget};
use crate::common::id::{MonotonicAtomicGenerator, SessionId};
use crate::common::{AuthKey, HostAndPort};
use crate::transport::{self, ContextConfig, TransportError};

/// Owns the client's QUIC endpoint and every session opened through it
///
/// Sessions share the endpoint but each has its own connection to its gateway. Sessions
/// remain registered until dropped through [`TunnelContext::drop_session`] or [`TunnelContext::close`].
pub struct TunnelContext {
  endpoint: quinn::Endpoint,
  client_config: quinn::ClientConfig,
  config: ContextConfig,
  sessions: DashMap<SessionId, Arc<TunnelSession>>,
  session_ids: MonotonicAtomicGenerator,
  shutdown: CancellationToken,
  closed: AtomicBool,
}

impl std::fmt::Debug for TunnelContext {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TunnelContext")
      .field("local_addr", &self.endpoint.local_addr().ok())
      .field("sessions", &self.sessions.len())
      .field("closed", &self.is_closed())
      .finish()
  }
}

impl TunnelContext {
  /// Binds the endpoint; must be called from within a Tokio runtime
  pub fn create(config: ContextConfig, roots: rustls::RootCertStore) -> Result<Self, TransportError> {
    let client_config = transport::client_config(roots, &config)?;
    Self::with_client_config(config, client_config)
  }

  pub fn with_client_config(
    config: ContextConfig,
    client_config: quinn::ClientConfig,
  ) -> Result<Self, TransportError> {
    let endpoint = transport::bind_client_endpoint(config.bind_address)?;
    tracing::debug!(local_addr = ?endpoint.local_addr().ok(), "Tunnel context bound");
    Ok(Self {
      endpoint,
      client_config,
      config,
      sessions: DashMap::new(),
      session_ids: MonotonicAtomicGenerator::default(),
      shutdown: CancellationToken::new(),
      closed: AtomicBool::new(false),
    })
  }

  pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
    self.endpoint.local_addr()
  }

  pub fn config(&self) -> &ContextConfig {
    &self.config
  }

  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::Acquire)
  }

  /// Opens a session for a tunneled descriptor
  pub async fn open_session(
    &self,
    descriptor: &AddressDescriptor,
  ) -> Result<SessionId, SessionError> {
    let target = descriptor.tunnel().ok_or(SessionError::NotTunneled)?;
    self
      .open_session_to(
        target.gateway.clone(),
        descriptor.destination().clone(),
        target.auth_key.clone(),
      )
      .await
  }

  pub async fn open_session_to(
    &self,
    gateway: HostAndPort,
    destination: HostAndPort,
    auth_key: AuthKey,
  ) -> Result<SessionId, SessionError> {
    if self.is_closed() {
      return Err(SessionError::ContextClosed);
    }
    let id = self.session_ids.next_session_id();
    let opening = TunnelSession::open(
      id,
      &self.endpoint,
      self.client_config.clone(),
      TunnelTarget { gateway, auth_key },
      destination,
      &self.config,
      self.shutdown.child_token(),
    );
    let session = tokio::select! {
      _ = self.shutdown.cancelled() => return Err(SessionError::ContextClosed),
      session = opening => session?,
    };
    self.sessions.insert(id, session.clone());
    if self.is_closed() {
      // Raced with close(), which may have already swept the session table
      self.sessions.remove(&id);
      session.close().await;
      return Err(SessionError::ContextClosed);
    }
    Ok(id)
  }

  pub fn session(&self, id: SessionId) -> Option<Arc<TunnelSession>> {
    self.sessions.get(&id).map(|entry| entry.value().clone())
  }

  pub fn session_count(&self) -> usize {
    self.sessions.len()
  }

  /// Closes and forgets a session; returns false if it was already gone
  pub async fn drop_session(&self, id: SessionId) -> bool {
    match self.sessions.remove(&id) {
      Some((_, session)) => {
        session.close().await;
        true
      }
      None => false,
    }
  }

  /// Closes every session, then the endpoint; later calls return immediately
  pub async fn close(&self) {
    if self.closed.swap(true, Ordering::AcqRel) {
      return;
    }
    self.shutdown.cancel();
    let ids: Vec<SessionId> = self.sessions.iter().map(|entry| *entry.key()).collect();
    let sessions: Vec<Arc<TunnelSession>> = ids
      .into_iter()
      .filter_map(|id| self.sessions.remove(&id).map(|(_, session)| session))
      .collect();
    futures::future::join_all(sessions.iter().map(|session| session.close())).await;
    self.endpoint.close(
      quinn::VarInt::from_u32(crate::common::protocol::close_codes::NORMAL),
      b"context closed",
    );
    tracing::debug!(closed_sessions = sessions.len(), "Tunnel context closed");
  }
}
