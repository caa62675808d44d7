// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Handle-based surface for a host process that drives tunnels from its own threads
//!
//! Each context owns a private Tokio runtime. Calls block on that runtime, so they must come
//! from threads which are not themselves running inside a Tokio runtime. Calls on the same
//! session handle are serialized; calls on different sessions proceed independently.
//! Teardown is explicit: every `drop_*` is idempotent, and nothing relies on finalizers.
use std::sync::{Arc, Mutex, PoisonError, Weak};

use dashmap::DashMap;

use crate::client::{SessionError, StateError, TunnelContext};
use crate::common::address::{HostAndPort, ParseError, DEFAULT_GAME_PORT};
use crate::common::cipher::InvalidKeyLength;
use crate::common::id::{MonotonicAtomicGenerator, SessionId};
use crate::common::{AuthKey, CipherKey};
use crate::transport::{ContextConfig, TransportError};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ContextHandle(u64);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct SessionHandle(u64);

impl ContextHandle {
  pub fn from_raw(raw: u64) -> Self {
    Self(raw)
  }

  pub fn into_raw(self) -> u64 {
    self.0
  }
}

impl SessionHandle {
  pub fn from_raw(raw: u64) -> Self {
    Self(raw)
  }

  pub fn into_raw(self) -> u64 {
    self.0
  }
}

#[derive(thiserror::Error, Debug)]
pub enum HostError {
  #[error("Unknown or dropped context handle")]
  UnknownContext,
  #[error("Unknown or dropped session handle")]
  UnknownSession,
  #[error("Failed to start the context runtime")]
  Runtime(#[source] std::io::Error),
  #[error(transparent)]
  Transport(#[from] TransportError),
  #[error(transparent)]
  Address(#[from] ParseError),
  #[error(transparent)]
  Session(#[from] SessionError),
  #[error(transparent)]
  State(#[from] StateError),
  #[error(transparent)]
  InvalidKey(#[from] InvalidKeyLength),
}

struct HostContext {
  context: TunnelContext,
  // Declared last so the context is torn down while its runtime still exists
  runtime: tokio::runtime::Runtime,
}

struct SessionBinding {
  context: Weak<HostContext>,
  id: SessionId,
  calls: Mutex<()>,
}

pub struct HandleTable {
  config: ContextConfig,
  roots: rustls::RootCertStore,
  contexts: DashMap<ContextHandle, Arc<HostContext>>,
  sessions: DashMap<SessionHandle, Arc<SessionBinding>>,
  handles: MonotonicAtomicGenerator,
}

impl std::fmt::Debug for HandleTable {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("HandleTable")
      .field("contexts", &self.contexts.len())
      .field("sessions", &self.sessions.len())
      .finish()
  }
}

impl HandleTable {
  /// Contexts created through this table trust `roots` when verifying gateways
  pub fn new(config: ContextConfig, roots: rustls::RootCertStore) -> Self {
    Self {
      config,
      roots,
      contexts: DashMap::new(),
      sessions: DashMap::new(),
      handles: MonotonicAtomicGenerator::default(),
    }
  }

  pub fn init(&self) -> Result<ContextHandle, HostError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
      .enable_all()
      .thread_name("quicgate-context")
      .build()
      .map_err(HostError::Runtime)?;
    let context = {
      let _entered = runtime.enter();
      TunnelContext::create(self.config.clone(), self.roots.clone())?
    };
    let handle = ContextHandle(self.handles.next_raw());
    self
      .contexts
      .insert(handle, Arc::new(HostContext { context, runtime }));
    tracing::debug!(?handle, "Context created");
    Ok(handle)
  }

  /// Opens a tunnel session; `destination` is `host[:port]`, defaulting to the game port
  pub fn create_session(
    &self,
    context: ContextHandle,
    gateway_host: &str,
    gateway_port: u16,
    destination: &str,
    auth_key: &[u8],
  ) -> Result<SessionHandle, HostError> {
    let host = self.context(context)?;
    let gateway = HostAndPort::validated(gateway_host, gateway_port)?;
    let destination = HostAndPort::parse(destination, DEFAULT_GAME_PORT)?;
    let id = host.runtime.block_on(host.context.open_session_to(
      gateway,
      destination,
      AuthKey::new(auth_key),
    ))?;
    self.register_session(context, &host, id)
  }

  /// Issues a handle for `id`, unless `drop_context` removed the context while it was opening
  fn register_session(
    &self,
    context: ContextHandle,
    host: &Arc<HostContext>,
    id: SessionId,
  ) -> Result<SessionHandle, HostError> {
    let handle = SessionHandle(self.handles.next_raw());
    self.sessions.insert(
      handle,
      Arc::new(SessionBinding {
        context: Arc::downgrade(host),
        id,
        calls: Mutex::new(()),
      }),
    );
    // Pairs with drop_context, which removes the context before sweeping its sessions
    if !self.contexts.contains_key(&context) {
      self.sessions.remove(&handle);
      host.runtime.block_on(host.context.drop_session(id));
      return Err(HostError::UnknownContext);
    }
    Ok(handle)
  }

  pub fn local_port(&self, session: SessionHandle) -> Result<u16, HostError> {
    let binding = self.binding(session)?;
    let _serialized = binding.calls.lock().unwrap_or_else(PoisonError::into_inner);
    let (_, tunnel) = Self::resolve(&binding)?;
    Ok(tunnel.local_port())
  }

  pub fn enable_encryption(&self, session: SessionHandle, key: &[u8]) -> Result<(), HostError> {
    let key = CipherKey::try_from(key)?;
    let binding = self.binding(session)?;
    let _serialized = binding.calls.lock().unwrap_or_else(PoisonError::into_inner);
    let (host, tunnel) = Self::resolve(&binding)?;
    host.runtime.block_on(tunnel.enable_encryption(key))?;
    Ok(())
  }

  /// Closes a session; unknown or already-dropped handles are ignored
  pub fn drop_session(&self, session: SessionHandle) {
    let binding = match self.sessions.remove(&session) {
      Some((_, binding)) => binding,
      None => return,
    };
    let _serialized = binding.calls.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(host) = binding.context.upgrade() {
      host.runtime.block_on(host.context.drop_session(binding.id));
    }
  }

  /// Closes a context and every session it issued; unknown handles are ignored
  pub fn drop_context(&self, context: ContextHandle) {
    let host = match self.contexts.remove(&context) {
      Some((_, host)) => host,
      None => return,
    };
    self.sessions.retain(|_, binding| {
      !std::ptr::eq(binding.context.as_ptr(), Arc::as_ptr(&host))
    });
    host.runtime.block_on(host.context.close());
    tracing::debug!(?context, "Context dropped");
  }

  pub fn context_count(&self) -> usize {
    self.contexts.len()
  }

  pub fn session_count(&self) -> usize {
    self.sessions.len()
  }

  fn context(&self, context: ContextHandle) -> Result<Arc<HostContext>, HostError> {
    self
      .contexts
      .get(&context)
      .map(|entry| entry.value().clone())
      .ok_or(HostError::UnknownContext)
  }

  fn binding(&self, session: SessionHandle) -> Result<Arc<SessionBinding>, HostError> {
    self
      .sessions
      .get(&session)
      .map(|entry| entry.value().clone())
      .ok_or(HostError::UnknownSession)
  }

  fn resolve(
    binding: &SessionBinding,
  ) -> Result<(Arc<HostContext>, Arc<crate::client::TunnelSession>), HostError> {
    let host = binding.context.upgrade().ok_or(HostError::UnknownSession)?;
    let tunnel = host
      .context
      .session(binding.id)
      .ok_or(HostError::UnknownSession)?;
    Ok((host, tunnel))
  }
}

impl Drop for HandleTable {
  fn drop(&mut self) {
    let contexts: Vec<ContextHandle> = self.contexts.iter().map(|entry| *entry.key()).collect();
    for context in contexts {
      self.drop_context(context);
    }
  }
}
