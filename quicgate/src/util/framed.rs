// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Length-prefixed fields as used by the control stream
//!
//! Each field is a big-endian `u16` byte count followed by that many bytes.

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum NextExpected {
  LengthSpecifier,
  Content { length: usize },
  Fixed { width: usize },
}

#[derive(thiserror::Error, Debug)]
pub enum ReadError {
  #[error("Field length exceeded expectation of {expected} bytes with {received}")]
  MaxLengthExceeded { expected: usize, received: usize },
  #[error("Unexpected end of field; expected {expected:?}")]
  UnexpectedEnd {
    expected: NextExpected,
    #[source]
    error: ::std::io::Error,
  },
}

impl ReadError {
  /// True when the peer finished the stream cleanly at a message boundary
  pub fn is_clean_end(&self) -> bool {
    matches!(
      self,
      ReadError::UnexpectedEnd {
        expected: NextExpected::LengthSpecifier | NextExpected::Fixed { width: 1 },
        error,
      } if error.kind() == ::std::io::ErrorKind::UnexpectedEof
    )
  }
}

#[derive(thiserror::Error, Debug)]
pub enum WriteError {
  #[error("Field write failure: {0:?}")]
  UnexpectedEnd(#[from] ::std::io::Error),
  /// Returned before anything is written, so the stream is never left mid-field
  #[error("Field length exceeded maximum of {expected} bytes with {produced}")]
  MaxLengthExceeded { expected: usize, produced: usize },
}

pub async fn read_field<T: tokio::io::AsyncRead + Unpin>(
  mut s: T,
  max_length: Option<usize>,
) -> Result<Vec<u8>, ReadError> {
  use tokio::io::AsyncReadExt;
  let length = s
    .read_u16()
    .await
    .map_err(|error| ReadError::UnexpectedEnd {
      expected: NextExpected::LengthSpecifier,
      error,
    })? as usize;
  if let Some(max_length) = max_length {
    if length > max_length {
      return Err(ReadError::MaxLengthExceeded {
        expected: max_length,
        received: length,
      });
    }
  }
  let mut buffer = vec![0u8; length];
  s.read_exact(buffer.as_mut_slice())
    .await
    .map_err(|error| ReadError::UnexpectedEnd {
      expected: NextExpected::Content { length },
      error,
    })?;
  Ok(buffer)
}

pub async fn read_u8<T: tokio::io::AsyncRead + Unpin>(mut s: T) -> Result<u8, ReadError> {
  use tokio::io::AsyncReadExt;
  s.read_u8()
    .await
    .map_err(|error| ReadError::UnexpectedEnd {
      expected: NextExpected::Fixed { width: 1 },
      error,
    })
}

pub async fn read_u16<T: tokio::io::AsyncRead + Unpin>(mut s: T) -> Result<u16, ReadError> {
  use tokio::io::AsyncReadExt;
  s.read_u16()
    .await
    .map_err(|error| ReadError::UnexpectedEnd {
      expected: NextExpected::Fixed { width: 2 },
      error,
    })
}

pub async fn read_u64<T: tokio::io::AsyncRead + Unpin>(mut s: T) -> Result<u64, ReadError> {
  use tokio::io::AsyncReadExt;
  s.read_u64()
    .await
    .map_err(|error| ReadError::UnexpectedEnd {
      expected: NextExpected::Fixed { width: 8 },
      error,
    })
}

/// Appends a length-prefixed field to an outgoing message buffer
pub fn put_field(buffer: &mut Vec<u8>, field: &[u8]) -> Result<(), WriteError> {
  let length = u16::try_from(field.len()).map_err(|_| WriteError::MaxLengthExceeded {
    expected: u16::MAX as usize,
    produced: field.len(),
  })?;
  buffer.extend_from_slice(&length.to_be_bytes());
  buffer.extend_from_slice(field);
  Ok(())
}

/// Writes a fully-assembled message in one call, then flushes
pub async fn write_message<T: tokio::io::AsyncWrite + Unpin>(
  mut s: T,
  message: &[u8],
) -> Result<(), WriteError> {
  use tokio::io::AsyncWriteExt;
  s.write_all(message).await?;
  Ok(s.flush().await?)
}

#[cfg(test)]
mod tests {
  use super::{put_field, read_field, write_message, ReadError, WriteError};

  #[tokio::test]
  async fn field_layout_is_length_then_content() {
    let mut message = Vec::new();
    put_field(&mut message, b"hello").unwrap();
    assert_eq!(&message[..2], &5u16.to_be_bytes());
    assert_eq!(&message[2..], b"hello");

    let mut cursor = std::io::Cursor::new(message);
    let field = read_field(&mut cursor, None).await.unwrap();
    assert_eq!(field, b"hello");
  }

  #[tokio::test]
  async fn zero_length_fields_are_permitted() {
    let mut message = Vec::new();
    put_field(&mut message, &[]).unwrap();
    assert_eq!(message.len(), std::mem::size_of::<u16>());
    let field = read_field(std::io::Cursor::new(message), None)
      .await
      .unwrap();
    assert!(field.is_empty());
  }

  #[test]
  fn oversized_field_is_refused_without_writing() {
    let mut message = Vec::new();
    let field = vec![0u8; u16::MAX as usize + 1];
    assert!(matches!(
      put_field(&mut message, &field),
      Err(WriteError::MaxLengthExceeded { .. })
    ));
    assert!(
      message.is_empty(),
      "Buffer must not have been written to during a max length error"
    );
  }

  #[tokio::test]
  async fn declared_length_above_maximum_is_refused() {
    let mut message = Vec::new();
    put_field(&mut message, b"0123456789").unwrap();
    let result = read_field(std::io::Cursor::new(message), Some(4)).await;
    assert!(matches!(
      result,
      Err(ReadError::MaxLengthExceeded {
        expected: 4,
        received: 10
      })
    ));
  }

  #[tokio::test]
  async fn truncated_content_is_an_unexpected_end() {
    let mut message = Vec::new();
    put_field(&mut message, b"abcdef").unwrap();
    message.truncate(4);
    let error = read_field(std::io::Cursor::new(message), None)
      .await
      .unwrap_err();
    assert!(matches!(error, ReadError::UnexpectedEnd { .. }));
    assert!(!error.is_clean_end());
  }

  #[tokio::test]
  async fn empty_stream_is_a_clean_end() {
    let error = read_field(std::io::Cursor::new(Vec::new()), None)
      .await
      .unwrap_err();
    assert!(error.is_clean_end());
  }

  #[tokio::test]
  async fn write_message_flushes_whole_buffer() {
    let (mut near, mut far) = tokio::io::duplex(64);
    write_message(&mut near, b"abc").await.unwrap();
    let mut received = [0u8; 3];
    tokio::io::AsyncReadExt::read_exact(&mut far, &mut received)
      .await
      .unwrap();
    assert_eq!(&received, b"abc");
  }
}
