// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Control stream messages
//!
//! Client to gateway, all integers big-endian:
//! - `ConnectTo`: `{authKeyLength: u16, authKey, destHostLength: u16, destHost, destPort: u16}`,
//!   always the first message.
//! - `KeyUpdate`: `{tag: KEY_UPDATE, keyLength: u16, key, uplinkOffset: u64}`, at most once.
//!
//! Gateway to client: single reply tags acknowledging each of the above.
use tokio::io::{AsyncRead, AsyncWrite};

use crate::common::address::HostAndPort;
use crate::common::authentication::AuthKey;
use crate::common::cipher::{CipherKey, InvalidKeyLength, CIPHER_KEY_LENGTH};
use crate::util::framed::{self, put_field, write_message};

pub const MAX_AUTH_KEY_LENGTH: usize = 1024;
pub const MAX_DESTINATION_HOST_LENGTH: usize = 255;

pub const KEY_UPDATE: u8 = 0x01;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reply {
  ConnectAcknowledged = 0x80,
  KeyUpdateAcknowledged = 0x81,
}

#[derive(thiserror::Error, Debug)]
pub enum ControlError {
  #[error("Control stream read failed")]
  Read(#[from] framed::ReadError),
  #[error("Control stream write failed")]
  Write(#[from] framed::WriteError),
  #[error("Peer closed the control stream")]
  Finished,
  #[error("Unknown control message tag {0:#04x}")]
  UnknownTag(u8),
  #[error("Expected {expected:?} but received tag {received:#04x}")]
  UnexpectedReply { expected: Reply, received: u8 },
  #[error("Destination is not a valid host: {0}")]
  InvalidDestination(&'static str),
  #[error(transparent)]
  InvalidKey(#[from] InvalidKeyLength),
}

impl ControlError {
  fn from_read(error: framed::ReadError) -> Self {
    if error.is_clean_end() {
      Self::Finished
    } else {
      Self::Read(error)
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTo {
  pub auth_key: AuthKey,
  pub destination: HostAndPort,
}

impl ConnectTo {
  pub fn encode(&self) -> Result<Vec<u8>, ControlError> {
    if self.auth_key.len() > MAX_AUTH_KEY_LENGTH {
      return Err(ControlError::Write(framed::WriteError::MaxLengthExceeded {
        expected: MAX_AUTH_KEY_LENGTH,
        produced: self.auth_key.len(),
      }));
    }
    let host = self.destination.host().as_bytes();
    if host.len() > MAX_DESTINATION_HOST_LENGTH {
      return Err(ControlError::Write(framed::WriteError::MaxLengthExceeded {
        expected: MAX_DESTINATION_HOST_LENGTH,
        produced: host.len(),
      }));
    }
    let mut message = Vec::with_capacity(6 + self.auth_key.len() + host.len());
    put_field(&mut message, self.auth_key.as_bytes())?;
    put_field(&mut message, host)?;
    message.extend_from_slice(&self.destination.port().to_be_bytes());
    Ok(message)
  }

  pub async fn read_from<R: AsyncRead + Unpin>(mut recv: R) -> Result<Self, ControlError> {
    let auth_key = framed::read_field(&mut recv, Some(MAX_AUTH_KEY_LENGTH))
      .await
      .map_err(ControlError::from_read)?;
    let host = framed::read_field(&mut recv, Some(MAX_DESTINATION_HOST_LENGTH)).await?;
    let port = framed::read_u16(&mut recv).await?;
    let host =
      String::from_utf8(host).map_err(|_| ControlError::InvalidDestination("host is not UTF-8"))?;
    let destination = HostAndPort::validated(host, port).map_err(|e| match e {
      crate::common::ParseError::Invalid(reason) | crate::common::ParseError::Malformed(reason) => {
        ControlError::InvalidDestination(reason)
      }
    })?;
    Ok(Self {
      auth_key: AuthKey::new(auth_key),
      destination,
    })
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyUpdate {
  pub key: CipherKey,
  /// Count of data-stream bytes, excluding the preamble, that the client forwarded before
  /// this key took effect
  pub uplink_offset: u64,
}

impl KeyUpdate {
  pub fn encode(&self) -> Result<Vec<u8>, ControlError> {
    let mut message = Vec::with_capacity(1 + 2 + CIPHER_KEY_LENGTH + 8);
    message.push(KEY_UPDATE);
    put_field(&mut message, self.key.as_bytes())?;
    message.extend_from_slice(&self.uplink_offset.to_be_bytes());
    Ok(message)
  }

  /// Reads the next key update, or `None` if the client finished the control stream
  pub async fn read_from<R: AsyncRead + Unpin>(mut recv: R) -> Result<Option<Self>, ControlError> {
    let tag = match framed::read_u8(&mut recv).await {
      Ok(tag) => tag,
      Err(e) if e.is_clean_end() => return Ok(None),
      Err(e) => return Err(e.into()),
    };
    if tag != KEY_UPDATE {
      return Err(ControlError::UnknownTag(tag));
    }
    let key = framed::read_field(&mut recv, Some(CIPHER_KEY_LENGTH)).await?;
    let key = CipherKey::try_from(key.as_slice())?;
    let uplink_offset = framed::read_u64(&mut recv).await?;
    Ok(Some(Self { key, uplink_offset }))
  }
}

/// One side of a control stream
#[derive(Debug)]
pub struct ControlChannel<W, R> {
  send: W,
  recv: R,
}

impl<W, R> ControlChannel<W, R>
where
  W: AsyncWrite + Unpin,
  R: AsyncRead + Unpin,
{
  pub fn new(send: W, recv: R) -> Self {
    Self { send, recv }
  }

  pub fn into_inner(self) -> (W, R) {
    (self.send, self.recv)
  }

  pub fn send_mut(&mut self) -> &mut W {
    &mut self.send
  }

  pub async fn send_connect(&mut self, request: &ConnectTo) -> Result<(), ControlError> {
    let message = request.encode()?;
    write_message(&mut self.send, &message).await?;
    Ok(())
  }

  pub async fn receive_connect(&mut self) -> Result<ConnectTo, ControlError> {
    ConnectTo::read_from(&mut self.recv).await
  }

  pub async fn send_key_update(&mut self, update: &KeyUpdate) -> Result<(), ControlError> {
    let message = update.encode()?;
    write_message(&mut self.send, &message).await?;
    Ok(())
  }

  pub async fn receive_key_update(&mut self) -> Result<Option<KeyUpdate>, ControlError> {
    KeyUpdate::read_from(&mut self.recv).await
  }

  pub async fn send_reply(&mut self, reply: Reply) -> Result<(), ControlError> {
    write_message(&mut self.send, &[reply as u8]).await?;
    Ok(())
  }

  pub async fn expect_reply(&mut self, expected: Reply) -> Result<(), ControlError> {
    let received = framed::read_u8(&mut self.recv)
      .await
      .map_err(ControlError::from_read)?;
    if received == expected as u8 {
      Ok(())
    } else {
      Err(ControlError::UnexpectedReply { expected, received })
    }
  }
}

#[cfg(test)]
mod tests {
  use super::{ConnectTo, ControlChannel, ControlError, KeyUpdate, Reply, KEY_UPDATE};
  use crate::common::{AuthKey, CipherKey, HostAndPort};
  use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

  type DuplexChannel = ControlChannel<WriteHalf<DuplexStream>, ReadHalf<DuplexStream>>;

  fn channel_pair() -> (DuplexChannel, DuplexChannel) {
    let (client, gateway) = tokio::io::duplex(4096);
    let (client_recv, client_send) = tokio::io::split(client);
    let (gateway_recv, gateway_send) = tokio::io::split(gateway);
    (
      ControlChannel::new(client_send, client_recv),
      ControlChannel::new(gateway_send, gateway_recv),
    )
  }

  #[test]
  fn connect_wire_layout() {
    let request = ConnectTo {
      auth_key: AuthKey::from("k1"),
      destination: HostAndPort::new("mc", 25565),
    };
    let encoded = request.encode().unwrap();
    assert_eq!(
      encoded,
      vec![0, 2, b'k', b'1', 0, 2, b'm', b'c', 0x63, 0xDD]
    );
  }

  #[test]
  fn key_update_wire_layout() {
    let update = KeyUpdate {
      key: CipherKey::new([7u8; 16]),
      uplink_offset: 258,
    };
    let encoded = update.encode().unwrap();
    assert_eq!(encoded[0], KEY_UPDATE);
    assert_eq!(&encoded[1..3], &16u16.to_be_bytes());
    assert_eq!(&encoded[3..19], &[7u8; 16]);
    assert_eq!(&encoded[19..], &258u64.to_be_bytes());
  }

  #[tokio::test]
  async fn connect_and_key_update_exchange() {
    let (mut client, mut gateway) = channel_pair();
    let request = ConnectTo {
      auth_key: AuthKey::from("secret"),
      destination: HostAndPort::new("game.example", 25570),
    };
    client.send_connect(&request).await.unwrap();
    assert_eq!(gateway.receive_connect().await.unwrap(), request);
    gateway.send_reply(Reply::ConnectAcknowledged).await.unwrap();
    client.expect_reply(Reply::ConnectAcknowledged).await.unwrap();

    let update = KeyUpdate {
      key: CipherKey::new(*b"0123456789abcdef"),
      uplink_offset: 42,
    };
    client.send_key_update(&update).await.unwrap();
    assert_eq!(gateway.receive_key_update().await.unwrap(), Some(update));
    gateway
      .send_reply(Reply::KeyUpdateAcknowledged)
      .await
      .unwrap();
    client
      .expect_reply(Reply::KeyUpdateAcknowledged)
      .await
      .unwrap();
  }

  #[tokio::test]
  async fn finished_control_stream_yields_no_update() {
    let (client, mut gateway) = channel_pair();
    drop(client);
    assert!(matches!(gateway.receive_key_update().await, Ok(None)));
  }

  #[tokio::test]
  async fn wrong_reply_is_reported() {
    let (mut client, mut gateway) = channel_pair();
    gateway
      .send_reply(Reply::KeyUpdateAcknowledged)
      .await
      .unwrap();
    assert!(matches!(
      client.expect_reply(Reply::ConnectAcknowledged).await,
      Err(ControlError::UnexpectedReply {
        expected: Reply::ConnectAcknowledged,
        received: 0x81
      })
    ));
  }

  #[tokio::test]
  async fn closed_gateway_is_finished_not_failed() {
    let (mut client, gateway) = channel_pair();
    drop(gateway);
    assert!(matches!(
      client.expect_reply(Reply::ConnectAcknowledged).await,
      Err(ControlError::Finished)
    ));
  }

  #[tokio::test]
  async fn oversized_auth_key_is_refused_by_the_reader() {
    let (mut client, mut gateway) = channel_pair();
    let mut message = Vec::new();
    crate::util::framed::put_field(&mut message, &vec![b'k'; 2048]).unwrap();
    crate::util::framed::write_message(client.send_mut(), &message)
      .await
      .unwrap();
    assert!(matches!(
      gateway.receive_connect().await,
      Err(ControlError::Read(
        crate::util::framed::ReadError::MaxLengthExceeded { .. }
      ))
    ));
  }

  #[tokio::test]
  async fn invalid_destination_is_refused() {
    let (mut client, mut gateway) = channel_pair();
    let mut message = Vec::new();
    crate::util::framed::put_field(&mut message, b"k").unwrap();
    crate::util::framed::put_field(&mut message, b"bad host/").unwrap();
    message.extend_from_slice(&25565u16.to_be_bytes());
    crate::util::framed::write_message(client.send_mut(), &message)
      .await
      .unwrap();
    assert!(matches!(
      gateway.receive_connect().await,
      Err(ControlError::InvalidDestination(_))
    ));
  }

  #[tokio::test]
  async fn short_cipher_key_is_refused() {
    let (mut client, mut gateway) = channel_pair();
    let mut message = vec![KEY_UPDATE];
    crate::util::framed::put_field(&mut message, &[1u8; 8]).unwrap();
    message.extend_from_slice(&0u64.to_be_bytes());
    crate::util::framed::write_message(client.send_mut(), &message)
      .await
      .unwrap();
    assert!(matches!(
      gateway.receive_key_update().await,
      Err(ControlError::InvalidKey(_))
    ));
  }

  #[tokio::test]
  async fn unknown_tag_is_refused() {
    let (mut client, mut gateway) = channel_pair();
    crate::util::framed::write_message(client.send_mut(), &[0x42])
      .await
      .unwrap();
    assert!(matches!(
      gateway.receive_key_update().await,
      Err(ControlError::UnknownTag(0x42))
    ));
  }
}
