// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Destination-leg stream cipher
//!
//! The game protocol encrypts with AES-128 in CFB8 mode, using the shared secret as both key
//! and IV. The gateway applies the same transform on the client's behalf once a key is relayed.
use aes::cipher::generic_array::GenericArray;
use aes::Aes128;
use cfb8::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};

pub const CIPHER_KEY_LENGTH: usize = 16;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("Cipher key must be exactly 16 bytes, got {0}")]
pub struct InvalidKeyLength(pub usize);

/// Opaque symmetric key supplied by the host; never derived or inspected here
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct CipherKey([u8; CIPHER_KEY_LENGTH]);

impl CipherKey {
  pub const fn new(key: [u8; CIPHER_KEY_LENGTH]) -> Self {
    Self(key)
  }

  pub fn as_bytes(&self) -> &[u8; CIPHER_KEY_LENGTH] {
    &self.0
  }

  pub fn encryptor(&self) -> StreamEncryptor {
    StreamEncryptor(cfb8::Encryptor::new(&self.0.into(), &self.0.into()))
  }

  pub fn decryptor(&self) -> StreamDecryptor {
    StreamDecryptor(cfb8::Decryptor::new(&self.0.into(), &self.0.into()))
  }
}

impl TryFrom<&[u8]> for CipherKey {
  type Error = InvalidKeyLength;

  fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
    <[u8; CIPHER_KEY_LENGTH]>::try_from(value)
      .map(Self)
      .map_err(|_| InvalidKeyLength(value.len()))
  }
}

impl From<[u8; CIPHER_KEY_LENGTH]> for CipherKey {
  fn from(key: [u8; CIPHER_KEY_LENGTH]) -> Self {
    Self(key)
  }
}

impl std::fmt::Debug for CipherKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str("CipherKey(..)")
  }
}

/// Encrypts bytes headed to the destination; state carries across calls
pub struct StreamEncryptor(cfb8::Encryptor<Aes128>);

impl StreamEncryptor {
  pub fn apply(&mut self, buffer: &mut [u8]) {
    for byte in buffer.iter_mut() {
      self
        .0
        .encrypt_block_mut(GenericArray::from_mut_slice(std::slice::from_mut(byte)));
    }
  }
}

/// Decrypts bytes arriving from the destination; state carries across calls
pub struct StreamDecryptor(cfb8::Decryptor<Aes128>);

impl StreamDecryptor {
  pub fn apply(&mut self, buffer: &mut [u8]) {
    for byte in buffer.iter_mut() {
      self
        .0
        .decrypt_block_mut(GenericArray::from_mut_slice(std::slice::from_mut(byte)));
    }
  }
}
