// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! QUIC endpoint, TLS and timeout configuration shared by clients and gateways
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as AnyhowContext;
use quinn::{IdleTimeout, TransportConfig, VarInt};
use serde::{Deserialize, Serialize};

use crate::common::protocol::close_codes;
use crate::common::HostAndPort;
use crate::util::ALPN_QUICGATE_1;

/// Client-opened bidirectional streams per tunnel: control, then data
pub const TUNNEL_STREAMS: u32 = 2;

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
  #[error("Failed to bind QUIC endpoint on {addr}")]
  Bind {
    addr: SocketAddr,
    #[source]
    error: std::io::Error,
  },
  #[error("Timeout of {0:?} is out of range for QUIC")]
  TimeoutOutOfRange(Duration),
  #[error("TLS configuration rejected")]
  Tls(#[from] rustls::Error),
}

/// Failure to establish a QUIC connection to a gateway
#[derive(thiserror::Error, Debug)]
pub enum DialError {
  #[error("Failed to resolve gateway {gateway}")]
  Resolve {
    gateway: String,
    #[source]
    error: std::io::Error,
  },
  #[error("Gateway {0} resolved to no addresses")]
  NoAddresses(String),
  #[error("Gateway connection could not be started")]
  Connect(#[from] quinn::ConnectError),
  #[error("Gateway connection failed")]
  Connection(#[from] quinn::ConnectionError),
  #[error("Timed out connecting to the gateway")]
  Timeout,
}

mod millis {
  use serde::{Deserialize, Deserializer, Serializer};
  use std::time::Duration;

  pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_millis() as u64)
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
  }
}

/// Client-side settings for a [`crate::client::TunnelContext`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContextConfig {
  pub bind_address: SocketAddr,
  /// Bounds gateway resolution plus the QUIC handshake
  #[serde(rename = "connect_timeout_ms", with = "millis")]
  pub connect_timeout: Duration,
  /// Bounds the connect request exchange, including the gateway's dial to the destination
  #[serde(rename = "handshake_timeout_ms", with = "millis")]
  pub handshake_timeout: Duration,
  #[serde(rename = "idle_timeout_ms", with = "millis")]
  pub idle_timeout: Duration,
  #[serde(rename = "keep_alive_interval_ms", with = "millis")]
  pub keep_alive_interval: Duration,
}

impl Default for ContextConfig {
  fn default() -> Self {
    Self {
      bind_address: SocketAddr::from(([0, 0, 0, 0], 0)),
      connect_timeout: Duration::from_secs(10),
      handshake_timeout: Duration::from_secs(15),
      idle_timeout: Duration::from_secs(30),
      keep_alive_interval: Duration::from_secs(5),
    }
  }
}

/// Gateway settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
  pub bind_address: SocketAddr,
  /// Bounds the TCP connection attempt to each destination
  #[serde(rename = "dial_timeout_ms", with = "millis")]
  pub dial_timeout: Duration,
  /// Bounds the QUIC handshake plus receipt of the connect request
  #[serde(rename = "handshake_timeout_ms", with = "millis")]
  pub handshake_timeout: Duration,
  #[serde(rename = "idle_timeout_ms", with = "millis")]
  pub idle_timeout: Duration,
  #[serde(rename = "keep_alive_interval_ms", with = "millis")]
  pub keep_alive_interval: Duration,
}

pub const DEFAULT_GATEWAY_PORT: u16 = 6666;

impl Default for GatewayConfig {
  fn default() -> Self {
    Self {
      bind_address: SocketAddr::from(([0, 0, 0, 0], DEFAULT_GATEWAY_PORT)),
      dial_timeout: Duration::from_secs(10),
      handshake_timeout: Duration::from_secs(30),
      idle_timeout: Duration::from_secs(30),
      keep_alive_interval: Duration::from_secs(5),
    }
  }
}

/// Builds transport parameters; `peer_bidi_streams` is how many streams the remote may open
pub fn transport_config(
  idle_timeout: Duration,
  keep_alive_interval: Duration,
  peer_bidi_streams: u32,
) -> Result<TransportConfig, TransportError> {
  let mut transport = TransportConfig::default();
  transport
    .max_idle_timeout(Some(
      IdleTimeout::try_from(idle_timeout)
        .map_err(|_| TransportError::TimeoutOutOfRange(idle_timeout))?,
    ))
    .keep_alive_interval(Some(keep_alive_interval))
    .max_concurrent_bidi_streams(VarInt::from_u32(peer_bidi_streams))
    .max_concurrent_uni_streams(VarInt::from_u32(0));
  Ok(transport)
}

pub fn client_config(
  roots: rustls::RootCertStore,
  config: &ContextConfig,
) -> Result<quinn::ClientConfig, TransportError> {
  let mut crypto = rustls::ClientConfig::builder()
    .with_safe_defaults()
    .with_root_certificates(roots)
    .with_no_client_auth();
  crypto.alpn_protocols = vec![ALPN_QUICGATE_1.to_vec()];
  let mut client_config = quinn::ClientConfig::new(Arc::new(crypto));
  client_config.transport_config(Arc::new(transport_config(
    config.idle_timeout,
    config.keep_alive_interval,
    0,
  )?));
  Ok(client_config)
}

pub fn server_config(
  cert_chain: Vec<rustls::Certificate>,
  key: rustls::PrivateKey,
  config: &GatewayConfig,
) -> Result<quinn::ServerConfig, TransportError> {
  let mut crypto = rustls::ServerConfig::builder()
    .with_safe_defaults()
    .with_no_client_auth()
    .with_single_cert(cert_chain, key)?;
  crypto.alpn_protocols = vec![ALPN_QUICGATE_1.to_vec()];
  let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
  server_config.transport = Arc::new(transport_config(
    config.idle_timeout,
    config.keep_alive_interval,
    TUNNEL_STREAMS,
  )?);
  Ok(server_config)
}

pub fn bind_client_endpoint(addr: SocketAddr) -> Result<quinn::Endpoint, TransportError> {
  quinn::Endpoint::client(addr).map_err(|error| TransportError::Bind { addr, error })
}

pub fn bind_server_endpoint(
  server_config: quinn::ServerConfig,
  addr: SocketAddr,
) -> Result<quinn::Endpoint, TransportError> {
  quinn::Endpoint::server(server_config, addr).map_err(|error| TransportError::Bind { addr, error })
}

/// Reads a certificate chain from PEM, falling back to a single DER certificate
pub fn load_certificate_chain(path: &Path) -> anyhow::Result<Vec<rustls::Certificate>> {
  let contents = std::fs::read(path)
    .with_context(|| format!("Failed reading certificate file {}", path.display()))?;
  let pem = rustls_pemfile::certs(&mut contents.as_slice())
    .context("Certificate PEM parsing failed")?;
  if pem.is_empty() {
    Ok(vec![rustls::Certificate(contents)])
  } else {
    Ok(pem.into_iter().map(rustls::Certificate).collect())
  }
}

/// Reads the first PKCS#8, RSA or SEC1 key from PEM, falling back to raw DER
pub fn load_private_key(path: &Path) -> anyhow::Result<rustls::PrivateKey> {
  let contents = std::fs::read(path)
    .with_context(|| format!("Failed reading private key file {}", path.display()))?;
  let items = rustls_pemfile::read_all(&mut contents.as_slice())
    .context("Private key PEM parsing failed")?;
  let key = items.into_iter().find_map(|item| match item {
    rustls_pemfile::Item::PKCS8Key(key)
    | rustls_pemfile::Item::RSAKey(key)
    | rustls_pemfile::Item::ECKey(key) => Some(key),
    _ => None,
  });
  match key {
    Some(key) => Ok(rustls::PrivateKey(key)),
    None if contents.starts_with(b"-----") => {
      Err(anyhow::Error::msg("No private key found in PEM file"))
    }
    None => Ok(rustls::PrivateKey(contents)),
  }
}

pub fn root_store_from(certificates: &[rustls::Certificate]) -> rustls::RootCertStore {
  let mut roots = rustls::RootCertStore::empty();
  let ders: Vec<Vec<u8>> = certificates.iter().map(|c| c.0.clone()).collect();
  let (added, ignored) = roots.add_parsable_certificates(&ders);
  tracing::debug!(added, ignored, "Loaded trust anchors");
  roots
}

/// Resolves `gateway`, preferring addresses of the endpoint's own family, and completes the
/// QUIC handshake within `timeout`
#[tracing::instrument(skip(endpoint, client_config), fields(gateway = %gateway), err)]
pub async fn connect(
  endpoint: &quinn::Endpoint,
  client_config: quinn::ClientConfig,
  gateway: &HostAndPort,
  timeout: Duration,
) -> Result<quinn::Connection, DialError> {
  let attempt = async {
    let candidates: Vec<SocketAddr> = tokio::net::lookup_host((gateway.host(), gateway.port()))
      .await
      .map_err(|error| DialError::Resolve {
        gateway: gateway.to_string(),
        error,
      })?
      .collect();
    let local_is_ipv4 = endpoint
      .local_addr()
      .map(|local| local.is_ipv4())
      .unwrap_or(true);
    let remote = candidates
      .iter()
      .find(|candidate| candidate.is_ipv4() == local_is_ipv4)
      .or_else(|| candidates.first())
      .copied()
      .ok_or_else(|| DialError::NoAddresses(gateway.to_string()))?;
    tracing::debug!(%remote, "Connecting to gateway");
    let connection = endpoint
      .connect_with(client_config, remote, gateway.host())?
      .await?;
    Ok::<_, DialError>(connection)
  };
  tokio::time::timeout(timeout, attempt)
    .await
    .map_err(|_| DialError::Timeout)?
}

/// Application close code and reason, if the peer closed the connection deliberately
pub fn application_close(connection: &quinn::Connection) -> Option<(u64, String)> {
  match connection.close_reason() {
    Some(quinn::ConnectionError::ApplicationClosed(close)) => Some((
      close.error_code.into_inner(),
      String::from_utf8_lossy(&close.reason).into_owned(),
    )),
    _ => None,
  }
}

pub fn close(connection: &quinn::Connection, code: u32, reason: &str) {
  tracing::debug!(
    code,
    meaning = close_codes::describe(code as u64),
    reason,
    "Closing connection"
  );
  connection.close(VarInt::from_u32(code), reason.as_bytes());
}

/// Finishes `stream`, treating a normal close by a peer that already read the end as success
pub async fn finish_stream(stream: &mut quinn::SendStream) -> Result<(), quinn::WriteError> {
  match stream.finish().await {
    Err(quinn::WriteError::ConnectionLost(quinn::ConnectionError::ApplicationClosed(close)))
      if close.error_code == VarInt::from_u32(close_codes::NORMAL) =>
    {
      Ok(())
    }
    result => result,
  }
}
