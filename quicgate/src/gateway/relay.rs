// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Relay pump: splices a tunnel's data stream with its destination TCP connection
//!
//! The client leg is never transformed. Once a key is relayed, bytes headed to the destination
//! are encrypted starting at the client-reported offset, and bytes from the destination are
//! decrypted from the moment of installation.
use std::sync::{Arc, Mutex, PoisonError};

use quinn::{RecvStream, SendStream};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::common::cipher::{CipherKey, StreamDecryptor, StreamEncryptor};
use crate::common::protocol::control::KeyUpdate;
use crate::util::RELAY_BUFFER_SIZE;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOrderError {
  #[error("A cipher key was already installed for this tunnel")]
  AlreadyInstalled,
  #[error("Key offset {offset} precedes {forwarded} bytes already relayed in cleartext")]
  OffsetInPast { offset: u64, forwarded: u64 },
}

#[derive(thiserror::Error, Debug)]
pub enum RelayError {
  #[error("Destination I/O failed")]
  Destination(#[from] std::io::Error),
  #[error("Writing to the client failed")]
  ClientWrite(#[from] quinn::WriteError),
  #[error("Reading from the client failed")]
  ClientRead(#[from] quinn::ReadError),
}

enum UplinkCipher {
  Cleartext,
  Pending { key: CipherKey, offset: u64 },
  Active(StreamEncryptor),
}

/// Cipher state of one tunnel, shared by the control handler and both pump directions
pub struct KeyState {
  uplink: UplinkCipher,
  downlink: Option<StreamDecryptor>,
  uplink_forwarded: u64,
}

impl Default for KeyState {
  fn default() -> Self {
    Self {
      uplink: UplinkCipher::Cleartext,
      downlink: None,
      uplink_forwarded: 0,
    }
  }
}

impl KeyState {
  pub fn is_installed(&self) -> bool {
    !matches!(self.uplink, UplinkCipher::Cleartext)
  }

  pub fn uplink_forwarded(&self) -> u64 {
    self.uplink_forwarded
  }

  pub fn install(&mut self, update: &KeyUpdate) -> Result<(), KeyOrderError> {
    if self.is_installed() {
      return Err(KeyOrderError::AlreadyInstalled);
    }
    if update.uplink_offset < self.uplink_forwarded {
      return Err(KeyOrderError::OffsetInPast {
        offset: update.uplink_offset,
        forwarded: self.uplink_forwarded,
      });
    }
    self.uplink = UplinkCipher::Pending {
      key: update.key,
      offset: update.uplink_offset,
    };
    self.downlink = Some(update.key.decryptor());
    Ok(())
  }

  /// Transforms the next chunk of client bytes bound for the destination
  pub fn outbound(&mut self, chunk: &mut [u8]) {
    let start = self.uplink_forwarded;
    self.uplink_forwarded += chunk.len() as u64;
    if let UplinkCipher::Pending { key, offset } = self.uplink {
      if self.uplink_forwarded > offset {
        self.uplink = UplinkCipher::Active(key.encryptor());
        let cleartext = offset.saturating_sub(start) as usize;
        if let UplinkCipher::Active(encryptor) = &mut self.uplink {
          encryptor.apply(&mut chunk[cleartext..]);
        }
      }
    } else if let UplinkCipher::Active(encryptor) = &mut self.uplink {
      encryptor.apply(chunk);
    }
  }

  /// Transforms the next chunk of destination bytes bound for the client
  pub fn inbound(&mut self, chunk: &mut [u8]) {
    if let Some(decryptor) = &mut self.downlink {
      decryptor.apply(chunk);
    }
  }
}

pub type SharedKeyState = Arc<Mutex<KeyState>>;

/// Why the pump stopped
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RelayEnd {
  ClientFinished,
  DestinationFinished,
}

pub struct RelayPump {
  keys: SharedKeyState,
}

impl RelayPump {
  pub fn new(keys: SharedKeyState) -> Self {
    Self { keys }
  }

  /// Forwards in both directions until either leg ends; the other leg is then closed too
  pub async fn run(
    self,
    client_send: SendStream,
    client_recv: RecvStream,
    destination: TcpStream,
  ) -> Result<RelayEnd, RelayError> {
    let (destination_read, destination_write) = destination.into_split();
    tokio::select! {
      result = Self::uplink(&self.keys, client_recv, destination_write) => result,
      result = Self::downlink(&self.keys, destination_read, client_send) => result,
    }
  }

  async fn uplink(
    keys: &SharedKeyState,
    mut client: RecvStream,
    mut destination: OwnedWriteHalf,
  ) -> Result<RelayEnd, RelayError> {
    let mut buffer = vec![0u8; RELAY_BUFFER_SIZE];
    while let Some(count) = client.read(&mut buffer).await? {
      let chunk = &mut buffer[..count];
      keys
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .outbound(chunk);
      destination.write_all(chunk).await?;
    }
    destination.shutdown().await?;
    Ok(RelayEnd::ClientFinished)
  }

  async fn downlink(
    keys: &SharedKeyState,
    mut destination: OwnedReadHalf,
    mut client: SendStream,
  ) -> Result<RelayEnd, RelayError> {
    let mut buffer = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
      let count = destination.read(&mut buffer).await?;
      if count == 0 {
        crate::transport::finish_stream(&mut client).await?;
        return Ok(RelayEnd::DestinationFinished);
      }
      let chunk = &mut buffer[..count];
      keys
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .inbound(chunk);
      client.write_all(chunk).await?;
    }
  }
}
