// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Loopback tests driving a real gateway and client context against each other
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::{SessionError, SessionState, StateError, TunnelContext};
use crate::common::authentication::traits::MockAuthenticationPolicy;
use crate::common::authentication::{AllowListPolicy, AuthError, AuthenticationPolicy};
use crate::common::protocol::control::{ControlChannel, Reply};
use crate::common::{AddressDescriptor, CipherKey, HostAndPort};
use crate::gateway::Gateway;
use crate::transport::{self, ContextConfig, DialError, GatewayConfig};

pub(crate) const TEST_AUTH_KEY: &str = "k1";
const KEY: CipherKey = CipherKey::new(*b"0123456789abcdef");
const PATIENCE: Duration = Duration::from_secs(5);

pub(crate) struct TestGateway {
  pub addr: SocketAddr,
  pub roots: rustls::RootCertStore,
  shutdown: CancellationToken,
  task: JoinHandle<()>,
}

impl TestGateway {
  pub async fn start() -> Self {
    Self::with_policy(Arc::new(AllowListPolicy::new([TEST_AUTH_KEY]))).await
  }

  pub async fn with_policy(policy: Arc<dyn AuthenticationPolicy>) -> Self {
    let (chain, key, roots) = loopback_identity();
    let config = GatewayConfig {
      bind_address: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
      dial_timeout: Duration::from_secs(2),
      ..GatewayConfig::default()
    };
    let server_config = transport::server_config(chain, key, &config).unwrap();
    let gateway = Gateway::bind(server_config, config, policy).unwrap();
    let addr = gateway.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let task = tokio::task::spawn(gateway.run(shutdown.clone()));
    Self {
      addr,
      roots,
      shutdown,
      task,
    }
  }

  pub fn address(&self) -> HostAndPort {
    HostAndPort::new("127.0.0.1", self.addr.port())
  }

  pub async fn stop(self) {
    self.shutdown.cancel();
    self.task.await.unwrap();
  }
}

/// Self-signed certificate for 127.0.0.1, plus a root store trusting it
fn loopback_identity() -> (
  Vec<rustls::Certificate>,
  rustls::PrivateKey,
  rustls::RootCertStore,
) {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
  let mut params = rcgen::CertificateParams::new(vec!["localhost".to_string()]);
  params
    .subject_alt_names
    .push(rcgen::SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));
  let certificate = rcgen::Certificate::from_params(params).unwrap();
  let chain = vec![rustls::Certificate(certificate.serialize_der().unwrap())];
  let key = rustls::PrivateKey(certificate.serialize_private_key_der());
  let roots = transport::root_store_from(&chain);
  (chain, key, roots)
}

pub(crate) fn test_context_config() -> ContextConfig {
  ContextConfig {
    bind_address: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
    connect_timeout: Duration::from_secs(3),
    handshake_timeout: Duration::from_secs(4),
    ..ContextConfig::default()
  }
}

async fn destination() -> (TcpListener, HostAndPort) {
  let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
  let port = listener.local_addr().unwrap().port();
  (listener, HostAndPort::new("127.0.0.1", port))
}

fn encrypted(plaintext: &[u8]) -> Vec<u8> {
  let mut bytes = plaintext.to_vec();
  KEY.encryptor().apply(&mut bytes);
  bytes
}

#[tokio::test]
async fn bytes_cross_the_tunnel_unchanged() {
  let gateway = TestGateway::start().await;
  let (listener, target) = destination().await;
  let server = tokio::task::spawn(async move {
    let (mut stream, _) = listener.accept().await.unwrap();
    let mut request = [0u8; 18];
    stream.read_exact(&mut request).await.unwrap();
    assert_eq!(&request, b"hello, destination");
    stream.write_all(b"hello, host").await.unwrap();
    stream
  });

  let context = TunnelContext::create(test_context_config(), gateway.roots.clone()).unwrap();
  let id = context
    .open_session_to(gateway.address(), target, TEST_AUTH_KEY.into())
    .await
    .unwrap();
  let session = context.session(id).unwrap();
  assert_eq!(session.state(), SessionState::Opening);
  assert_ne!(session.local_port(), 0);

  let mut host = TcpStream::connect((Ipv4Addr::LOCALHOST, session.local_port()))
    .await
    .unwrap();
  host.write_all(b"hello, destination").await.unwrap();
  let mut reply = [0u8; 11];
  tokio::time::timeout(PATIENCE, host.read_exact(&mut reply))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(&reply, b"hello, host");
  assert_eq!(session.state(), SessionState::Bridging);

  drop(server.await.unwrap());
  context.close().await;
  gateway.stop().await;
}

#[tokio::test]
async fn descriptor_opens_a_session() {
  let gateway = TestGateway::start().await;
  let (listener, target) = destination().await;
  let descriptor: AddressDescriptor = format!(
    "quic://{}@127.0.0.1/{}/{}",
    TEST_AUTH_KEY,
    gateway.addr.port(),
    target
  )
  .parse()
  .unwrap();
  let accepted = tokio::task::spawn(async move { listener.accept().await.map(|_| ()) });

  let context = TunnelContext::create(test_context_config(), gateway.roots.clone()).unwrap();
  let id = context.open_session(&descriptor).await.unwrap();
  accepted.await.unwrap().unwrap();
  assert_eq!(context.session(id).unwrap().destination(), &target);

  let direct = AddressDescriptor::direct(target);
  assert!(matches!(
    context.open_session(&direct).await,
    Err(SessionError::NotTunneled)
  ));

  context.close().await;
  gateway.stop().await;
}

#[tokio::test]
async fn silent_gateway_times_out() {
  let silent = std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
  let port = silent.local_addr().unwrap().port();
  let config = ContextConfig {
    connect_timeout: Duration::from_millis(300),
    ..test_context_config()
  };
  let context = TunnelContext::create(config, rustls::RootCertStore::empty()).unwrap();
  let result = context
    .open_session_to(
      HostAndPort::new("127.0.0.1", port),
      HostAndPort::new("game.example", 25565),
      TEST_AUTH_KEY.into(),
    )
    .await;
  assert!(matches!(
    result,
    Err(SessionError::Dial(DialError::Timeout))
  ));
  assert_eq!(context.session_count(), 0);
  context.close().await;
}

#[tokio::test]
async fn rejected_key_never_reaches_destination() {
  let mut policy = MockAuthenticationPolicy::new();
  policy
    .expect_authenticate()
    .times(1)
    .returning(|_| Err(AuthError::Rejected));
  let gateway = TestGateway::with_policy(Arc::new(policy)).await;
  let (listener, target) = destination().await;

  let context = TunnelContext::create(test_context_config(), gateway.roots.clone()).unwrap();
  let result = context
    .open_session_to(gateway.address(), target, "wrong".into())
    .await;
  assert!(matches!(result, Err(SessionError::Rejected)));
  assert!(
    tokio::time::timeout(Duration::from_millis(200), listener.accept())
      .await
      .is_err(),
    "Destination must not be dialed for a rejected key"
  );

  context.close().await;
  gateway.stop().await;
}

#[tokio::test]
async fn unreachable_destination_is_reported() {
  let gateway = TestGateway::start().await;
  let (listener, target) = destination().await;
  drop(listener);

  let context = TunnelContext::create(test_context_config(), gateway.roots.clone()).unwrap();
  let result = context
    .open_session_to(gateway.address(), target, TEST_AUTH_KEY.into())
    .await;
  assert!(matches!(result, Err(SessionError::DestinationUnreachable)));

  context.close().await;
  gateway.stop().await;
}

#[tokio::test]
async fn encryption_starts_exactly_at_the_key_boundary() {
  let gateway = TestGateway::start().await;
  let (listener, target) = destination().await;
  let server = tokio::task::spawn(async move {
    let (mut stream, _) = listener.accept().await.unwrap();
    let mut cleartext = [0u8; 5];
    stream.read_exact(&mut cleartext).await.unwrap();
    assert_eq!(&cleartext, b"hello");
    let mut ciphertext = [0u8; 6];
    stream.read_exact(&mut ciphertext).await.unwrap();
    assert_eq!(ciphertext.to_vec(), encrypted(b"secret"));
    stream.write_all(&encrypted(b"reply")).await.unwrap();
    stream
  });

  let context = TunnelContext::create(test_context_config(), gateway.roots.clone()).unwrap();
  let id = context
    .open_session_to(gateway.address(), target, TEST_AUTH_KEY.into())
    .await
    .unwrap();
  let session = context.session(id).unwrap();
  let mut host = TcpStream::connect((Ipv4Addr::LOCALHOST, session.local_port()))
    .await
    .unwrap();

  host.write_all(b"hello").await.unwrap();
  tokio::time::timeout(PATIENCE, session.enable_encryption(KEY))
    .await
    .unwrap()
    .unwrap();
  assert!(session.is_encryption_enabled());
  host.write_all(b"secret").await.unwrap();

  let mut reply = [0u8; 5];
  tokio::time::timeout(PATIENCE, host.read_exact(&mut reply))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(&reply, b"reply");

  drop(server.await.unwrap());
  context.close().await;
  gateway.stop().await;
}

#[tokio::test]
async fn key_before_host_connects_covers_the_whole_stream() {
  let gateway = TestGateway::start().await;
  let (listener, target) = destination().await;
  let server = tokio::task::spawn(async move {
    let (mut stream, _) = listener.accept().await.unwrap();
    let mut ciphertext = [0u8; 4];
    stream.read_exact(&mut ciphertext).await.unwrap();
    assert_eq!(ciphertext.to_vec(), encrypted(b"ping"));
    stream
  });

  let context = TunnelContext::create(test_context_config(), gateway.roots.clone()).unwrap();
  let id = context
    .open_session_to(gateway.address(), target, TEST_AUTH_KEY.into())
    .await
    .unwrap();
  let session = context.session(id).unwrap();
  session.enable_encryption(KEY).await.unwrap();

  let mut host = TcpStream::connect((Ipv4Addr::LOCALHOST, session.local_port()))
    .await
    .unwrap();
  host.write_all(b"ping").await.unwrap();
  drop(
    tokio::time::timeout(PATIENCE, server)
      .await
      .unwrap()
      .unwrap(),
  );

  context.close().await;
  gateway.stop().await;
}

#[tokio::test]
async fn host_disconnect_closes_the_destination() {
  let gateway = TestGateway::start().await;
  let (listener, target) = destination().await;
  let server = tokio::task::spawn(async move {
    let (mut stream, _) = listener.accept().await.unwrap();
    let mut received = Vec::new();
    stream.read_to_end(&mut received).await.unwrap();
    received
  });

  let context = TunnelContext::create(test_context_config(), gateway.roots.clone()).unwrap();
  let id = context
    .open_session_to(gateway.address(), target, TEST_AUTH_KEY.into())
    .await
    .unwrap();
  let session = context.session(id).unwrap();
  let mut host = TcpStream::connect((Ipv4Addr::LOCALHOST, session.local_port()))
    .await
    .unwrap();
  host.write_all(b"bye").await.unwrap();
  drop(host);

  let received = tokio::time::timeout(PATIENCE, server)
    .await
    .unwrap()
    .unwrap();
  assert_eq!(received, b"bye");
  tokio::time::timeout(PATIENCE, session.closed())
    .await
    .unwrap();
  assert_eq!(session.state(), SessionState::Closed);

  context.close().await;
  gateway.stop().await;
}

#[tokio::test]
async fn destination_disconnect_closes_the_host() {
  let gateway = TestGateway::start().await;
  let (listener, target) = destination().await;
  let server = tokio::task::spawn(async move {
    let (mut stream, _) = listener.accept().await.unwrap();
    stream.write_all(b"kicked").await.unwrap();
  });

  let context = TunnelContext::create(test_context_config(), gateway.roots.clone()).unwrap();
  let id = context
    .open_session_to(gateway.address(), target, TEST_AUTH_KEY.into())
    .await
    .unwrap();
  let session = context.session(id).unwrap();
  let mut host = TcpStream::connect((Ipv4Addr::LOCALHOST, session.local_port()))
    .await
    .unwrap();
  server.await.unwrap();

  let mut received = Vec::new();
  tokio::time::timeout(PATIENCE, host.read_to_end(&mut received))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(received, b"kicked");
  tokio::time::timeout(PATIENCE, session.closed())
    .await
    .unwrap();

  context.close().await;
  gateway.stop().await;
}

#[tokio::test]
async fn dropping_one_session_leaves_others_running() {
  let gateway = TestGateway::start().await;
  let (first_listener, first_target) = destination().await;
  let (second_listener, second_target) = destination().await;
  let echo = tokio::task::spawn(async move {
    let (mut stream, _) = second_listener.accept().await.unwrap();
    let mut buffer = [0u8; 4];
    stream.read_exact(&mut buffer).await.unwrap();
    stream.write_all(&buffer).await.unwrap();
    stream
  });
  let _first_accept = tokio::task::spawn(async move { first_listener.accept().await });

  let context = TunnelContext::create(test_context_config(), gateway.roots.clone()).unwrap();
  let first = context
    .open_session_to(gateway.address(), first_target, TEST_AUTH_KEY.into())
    .await
    .unwrap();
  let second = context
    .open_session_to(gateway.address(), second_target, TEST_AUTH_KEY.into())
    .await
    .unwrap();
  assert_ne!(first, second);
  assert_eq!(context.session_count(), 2);

  assert!(context.drop_session(first).await);
  assert!(!context.drop_session(first).await);
  assert!(context.session(first).is_none());

  let session = context.session(second).unwrap();
  let mut host = TcpStream::connect((Ipv4Addr::LOCALHOST, session.local_port()))
    .await
    .unwrap();
  host.write_all(b"ping").await.unwrap();
  let mut reply = [0u8; 4];
  tokio::time::timeout(PATIENCE, host.read_exact(&mut reply))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(&reply, b"ping");

  drop(echo.await.unwrap());
  context.close().await;
  gateway.stop().await;
}

#[tokio::test]
async fn closed_context_refuses_new_sessions() {
  let gateway = TestGateway::start().await;
  let (listener, target) = destination().await;
  let _accept = tokio::task::spawn(async move { listener.accept().await });

  let context = TunnelContext::create(test_context_config(), gateway.roots.clone()).unwrap();
  let id = context
    .open_session_to(gateway.address(), target.clone(), TEST_AUTH_KEY.into())
    .await
    .unwrap();
  let session = context.session(id).unwrap();

  context.close().await;
  context.close().await;
  assert!(context.is_closed());
  assert_eq!(context.session_count(), 0);
  assert_eq!(session.state(), SessionState::Closed);
  assert!(matches!(
    context
      .open_session_to(gateway.address(), target, TEST_AUTH_KEY.into())
      .await,
    Err(SessionError::ContextClosed)
  ));

  gateway.stop().await;
}

#[tokio::test]
async fn misuse_of_encryption_is_a_state_error() {
  let gateway = TestGateway::start().await;
  let (listener, target) = destination().await;
  let _accept = tokio::task::spawn(async move {
    let first = listener.accept().await;
    let second = listener.accept().await;
    (first, second)
  });

  let context = TunnelContext::create(test_context_config(), gateway.roots.clone()).unwrap();
  let id = context
    .open_session_to(gateway.address(), target.clone(), TEST_AUTH_KEY.into())
    .await
    .unwrap();
  let session = context.session(id).unwrap();
  session.enable_encryption(KEY).await.unwrap();
  assert_eq!(
    session.enable_encryption(KEY).await,
    Err(StateError::EncryptionAlreadyEnabled)
  );

  let id = context
    .open_session_to(gateway.address(), target, TEST_AUTH_KEY.into())
    .await
    .unwrap();
  let session = context.session(id).unwrap();
  session.close().await;
  session.close().await;
  assert_eq!(session.state(), SessionState::Closed);
  assert_eq!(
    session.enable_encryption(KEY).await,
    Err(StateError::Closed)
  );

  context.close().await;
  gateway.stop().await;
}

#[tokio::test]
async fn unacknowledged_key_closes_the_session() {
  let (chain, key, roots) = loopback_identity();
  let server_config = transport::server_config(chain, key, &GatewayConfig::default()).unwrap();
  let endpoint = transport::bind_server_endpoint(
    server_config,
    SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
  )
  .unwrap();
  let gateway_port = endpoint.local_addr().unwrap().port();
  // Accepts the tunnel, then reads the key update without ever answering it
  let silent_gateway = tokio::task::spawn(async move {
    let connection = endpoint.accept().await.unwrap().await.unwrap();
    let (send, recv) = connection.accept_bi().await.unwrap();
    let mut control = ControlChannel::new(send, recv);
    control.receive_connect().await.unwrap();
    control.send_reply(Reply::ConnectAcknowledged).await.unwrap();
    assert!(control.receive_key_update().await.unwrap().is_some());
    let closed = connection.closed().await;
    drop(control);
    closed
  });

  let config = ContextConfig {
    handshake_timeout: Duration::from_secs(1),
    ..test_context_config()
  };
  let context = TunnelContext::create(config, roots).unwrap();
  let id = context
    .open_session_to(
      HostAndPort::new("127.0.0.1", gateway_port),
      HostAndPort::new("game.example", 25565),
      TEST_AUTH_KEY.into(),
    )
    .await
    .unwrap();
  let session = context.session(id).unwrap();
  let mut host = TcpStream::connect((Ipv4Addr::LOCALHOST, session.local_port()))
    .await
    .unwrap();
  host.write_all(b"cleartext").await.unwrap();
  tokio::time::timeout(PATIENCE, async {
    while session.state() != SessionState::Bridging {
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
  })
  .await
  .unwrap();

  let installed = tokio::time::timeout(PATIENCE, session.enable_encryption(KEY))
    .await
    .unwrap();
  assert_eq!(installed, Err(StateError::Closed));
  assert!(!session.is_encryption_enabled());
  tokio::time::timeout(PATIENCE, session.closed()).await.unwrap();
  assert_eq!(session.state(), SessionState::Closed);

  let closed = tokio::time::timeout(PATIENCE, silent_gateway)
    .await
    .unwrap()
    .unwrap();
  assert!(matches!(closed, quinn::ConnectionError::ApplicationClosed(_)));
  drop(host);
  context.close().await;
}
