// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

/// Identifies a [`crate::client::TunnelSession`] within its owning context
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct SessionId(u64);

impl SessionId {
  pub fn new(inner: u64) -> SessionId {
    Self(inner)
  }

  pub fn inner(&self) -> u64 {
    self.0
  }
}

impl From<u64> for SessionId {
  fn from(inner: u64) -> Self {
    Self::new(inner)
  }
}

impl From<SessionId> for u64 {
  fn from(id: SessionId) -> Self {
    id.inner()
  }
}

impl std::fmt::Debug for SessionId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SessionId")
      .field("inner", &self.inner())
      .finish()
  }
}

impl std::fmt::Display for SessionId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Produces identifiers that are never reused for the lifetime of the generator
#[derive(Debug)]
pub struct MonotonicAtomicGenerator {
  next: std::sync::atomic::AtomicU64,
}

impl MonotonicAtomicGenerator {
  pub fn new(next: u64) -> Self {
    Self {
      next: std::sync::atomic::AtomicU64::new(next),
    }
  }

  pub fn next_raw(&self) -> u64 {
    self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
  }

  pub fn next_session_id(&self) -> SessionId {
    SessionId::new(self.next_raw())
  }
}

impl Default for MonotonicAtomicGenerator {
  fn default() -> Self {
    Self::new(1)
  }
}
