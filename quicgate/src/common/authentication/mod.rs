// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Gateway-side admission of tunnel requests
//!
//! Policies are consulted before any destination connection is opened, so that the gateway
//! cannot be used as an open relay.
mod allow_list;
mod shared_secret;
pub mod traits;

pub use allow_list::AllowListPolicy;
pub use shared_secret::SharedSecretPolicy;
pub use traits::{AuthError, AuthenticationPolicy};

/// Opaque key presented by a client in its connect request
///
/// `Debug` never prints the key material.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct AuthKey(Vec<u8>);

impl AuthKey {
  pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
    Self(bytes.into())
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.0
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}

impl From<&str> for AuthKey {
  fn from(key: &str) -> Self {
    Self::new(key.as_bytes())
  }
}

impl From<String> for AuthKey {
  fn from(key: String) -> Self {
    Self::new(key.into_bytes())
  }
}

impl From<Vec<u8>> for AuthKey {
  fn from(key: Vec<u8>) -> Self {
    Self::new(key)
  }
}

impl std::fmt::Debug for AuthKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("AuthKey")
      .field("length", &self.0.len())
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::AuthKey;

  #[test]
  fn debug_output_hides_key_material() {
    let key = AuthKey::from("hunter2");
    let printed = format!("{:?}", key);
    assert!(!printed.contains("hunter2"));
    assert!(printed.contains("length: 7"));
  }
}
