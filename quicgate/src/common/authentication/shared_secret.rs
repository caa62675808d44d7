// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use argon2::{Argon2, PasswordHash, PasswordVerifier};
use subtle::ConstantTimeEq;

use super::{AuthError, AuthKey, AuthenticationPolicy};

/// Admits clients presenting one configured secret
pub enum SharedSecretPolicy {
  Plaintext(AuthKey),
  /// Argon2 hash in PHC string format
  Hashed(String),
}

impl SharedSecretPolicy {
  pub fn plaintext(key: impl Into<AuthKey>) -> Self {
    Self::Plaintext(key.into())
  }

  /// Fails if `phc` is not a parseable password hash
  pub fn hashed(phc: impl Into<String>) -> Result<Self, argon2::password_hash::Error> {
    let phc = phc.into();
    PasswordHash::new(&phc)?;
    Ok(Self::Hashed(phc))
  }

  /// Treats the secret as a hash if it parses as one, otherwise as plaintext
  pub fn from_configured(secret: &str) -> Self {
    match Self::hashed(secret) {
      Ok(policy) => policy,
      Err(_) => Self::plaintext(secret),
    }
  }

  pub fn is_hashed(&self) -> bool {
    matches!(self, Self::Hashed(_))
  }
}

impl std::fmt::Debug for SharedSecretPolicy {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Plaintext(_) => f.write_str("SharedSecretPolicy::Plaintext"),
      Self::Hashed(_) => f.write_str("SharedSecretPolicy::Hashed"),
    }
  }
}

impl AuthenticationPolicy for SharedSecretPolicy {
  fn authenticate(&self, key: &AuthKey) -> Result<(), AuthError> {
    let accepted = match self {
      Self::Plaintext(expected) => bool::from(expected.as_bytes().ct_eq(key.as_bytes())),
      Self::Hashed(phc) => match PasswordHash::new(phc) {
        Ok(hash) => Argon2::default()
          .verify_password(key.as_bytes(), &hash)
          .is_ok(),
        Err(error) => {
          tracing::error!(?error, "Configured authentication hash failed to parse");
          false
        }
      },
    };
    if accepted {
      Ok(())
    } else {
      Err(AuthError::Rejected)
    }
  }
}
