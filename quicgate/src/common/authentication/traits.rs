// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use super::AuthKey;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
  /// Deliberately carries no detail about which part of the request was refused
  #[error("Authentication rejected")]
  Rejected,
}

/// Decides whether a presented key may open a tunnel through this gateway
#[cfg_attr(test, mockall::automock)]
pub trait AuthenticationPolicy: std::fmt::Debug + Send + Sync {
  fn authenticate(&self, key: &AuthKey) -> Result<(), AuthError>;
}

impl<T: AuthenticationPolicy + ?Sized> AuthenticationPolicy for std::sync::Arc<T> {
  fn authenticate(&self, key: &AuthKey) -> Result<(), AuthError> {
    T::authenticate(self, key)
  }
}

impl<T: AuthenticationPolicy + ?Sized> AuthenticationPolicy for Box<T> {
  fn authenticate(&self, key: &AuthKey) -> Result<(), AuthError> {
    T::authenticate(self, key)
  }
}
