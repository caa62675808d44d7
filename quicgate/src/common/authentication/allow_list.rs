// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use subtle::ConstantTimeEq;

use super::{AuthError, AuthKey, AuthenticationPolicy};

/// Admits clients presenting any one of several plaintext keys
///
/// Every configured key is compared, so timing does not reveal which entry matched.
pub struct AllowListPolicy {
  keys: Vec<AuthKey>,
}

impl AllowListPolicy {
  pub fn new<I, K>(keys: I) -> Self
  where
    I: IntoIterator<Item = K>,
    K: Into<AuthKey>,
  {
    Self {
      keys: keys.into_iter().map(Into::into).collect(),
    }
  }

  pub fn len(&self) -> usize {
    self.keys.len()
  }

  pub fn is_empty(&self) -> bool {
    self.keys.is_empty()
  }
}

impl std::fmt::Debug for AllowListPolicy {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("AllowListPolicy")
      .field("keys", &self.keys.len())
      .finish()
  }
}

impl AuthenticationPolicy for AllowListPolicy {
  fn authenticate(&self, key: &AuthKey) -> Result<(), AuthError> {
    let accepted = self.keys.iter().fold(subtle::Choice::from(0u8), |found, candidate| {
      found | candidate.as_bytes().ct_eq(key.as_bytes())
    });
    if bool::from(accepted) {
      Ok(())
    } else {
      Err(AuthError::Rejected)
    }
  }
}
