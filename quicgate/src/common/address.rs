// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Address descriptors naming either a direct game server or a tunnel through a gateway
//!
//! Direct: `host[:port]`, also accepted behind the legacy `quic://` prefix.
//!
//! Tunneled: `quic://<authKey>@<gatewayHost>/<gatewayPort>/<destinationHost>[:<destinationPort>]`,
//! or the compact `quic://<authKey>@<gatewayHost>:<gatewayPort>/<destinationHost>[:<destinationPort>]`.
use std::fmt::{Display, Formatter};
use std::net::Ipv6Addr;
use std::str::FromStr;

use super::authentication::AuthKey;
use super::protocol::control::{MAX_AUTH_KEY_LENGTH, MAX_DESTINATION_HOST_LENGTH};

/// Port assumed for a destination when the descriptor leaves it out
pub const DEFAULT_GAME_PORT: u16 = 25565;

pub const TUNNEL_SCHEME: &str = "quic://";

/// Characters which may never appear in a host, bracketed IPv6 literals aside
const FORBIDDEN_HOST_CHARACTERS: &[char] = &[
  '#', '%', '/', ':', '<', '>', '?', '@', '[', '\\', ']', '^', '|',
];

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
  /// Neither the direct nor the tunneled form matched
  #[error("Invalid address: {0}")]
  Invalid(&'static str),
  /// The tunneled form matched, but one of its segments is unusable
  #[error("Malformed tunnel address: {0}")]
  Malformed(&'static str),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ConnectionType {
  Normal,
  Tunneled,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostAndPort {
  host: String,
  port: u16,
}

impl HostAndPort {
  pub fn new(host: impl Into<String>, port: u16) -> Self {
    Self {
      host: host.into(),
      port,
    }
  }

  /// Parses `host`, `host:port`, `[ipv6]`, `[ipv6]:port`, or a bare IPv6 literal
  pub fn parse(input: &str, default_port: u16) -> Result<Self, ParseError> {
    split_host_port(input, Some(default_port)).map_err(ParseError::Invalid)
  }

  /// Checks a host and port received from elsewhere against the same rules as [`Self::parse`]
  pub fn validated(host: impl Into<String>, port: u16) -> Result<Self, ParseError> {
    let host = host.into();
    if port == 0 {
      return Err(ParseError::Invalid("port out of range"));
    }
    if host.contains(':') {
      host
        .parse::<Ipv6Addr>()
        .map_err(|_| ParseError::Invalid("host is not an IPv6 address"))?;
    } else {
      validate_host(&host).map_err(ParseError::Invalid)?;
    }
    Ok(Self { host, port })
  }

  pub fn host(&self) -> &str {
    &self.host
  }

  pub fn port(&self) -> u16 {
    self.port
  }

  pub fn is_ipv6_literal(&self) -> bool {
    self.host.contains(':')
  }
}

impl Display for HostAndPort {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    if self.is_ipv6_literal() {
      write!(f, "[{}]:{}", self.host, self.port)
    } else {
      write!(f, "{}:{}", self.host, self.port)
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelTarget {
  pub gateway: HostAndPort,
  pub auth_key: AuthKey,
}

/// A parsed address; immutable once constructed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressDescriptor {
  destination: HostAndPort,
  tunnel: Option<TunnelTarget>,
}

impl AddressDescriptor {
  pub fn direct(destination: HostAndPort) -> Self {
    Self {
      destination,
      tunnel: None,
    }
  }

  pub fn tunneled(destination: HostAndPort, gateway: HostAndPort, auth_key: AuthKey) -> Self {
    Self {
      destination,
      tunnel: Some(TunnelTarget { gateway, auth_key }),
    }
  }

  pub fn connection_type(&self) -> ConnectionType {
    match self.tunnel {
      Some(_) => ConnectionType::Tunneled,
      None => ConnectionType::Normal,
    }
  }

  pub fn is_tunneled(&self) -> bool {
    self.tunnel.is_some()
  }

  pub fn destination(&self) -> &HostAndPort {
    &self.destination
  }

  pub fn tunnel(&self) -> Option<&TunnelTarget> {
    self.tunnel.as_ref()
  }

  pub fn gateway(&self) -> Option<&HostAndPort> {
    self.tunnel.as_ref().map(|t| &t.gateway)
  }

  pub fn auth_key(&self) -> Option<&AuthKey> {
    self.tunnel.as_ref().map(|t| &t.auth_key)
  }
}

impl FromStr for AddressDescriptor {
  type Err = ParseError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    parse(s)
  }
}

/// Parses a descriptor without performing any I/O
pub fn parse(input: &str) -> Result<AddressDescriptor, ParseError> {
  let input = input.trim();
  if input.is_empty() {
    return Err(ParseError::Invalid("empty address"));
  }
  match input.strip_prefix(TUNNEL_SCHEME) {
    Some(rest) => match rest.rsplit_once('@') {
      Some((auth_key, target)) if target.contains('/') => parse_tunneled(auth_key, target),
      Some(_) => Err(ParseError::Invalid("tunnel address has no gateway segment")),
      None => HostAndPort::parse(rest, DEFAULT_GAME_PORT).map(AddressDescriptor::direct),
    },
    None => HostAndPort::parse(input, DEFAULT_GAME_PORT).map(AddressDescriptor::direct),
  }
}

fn parse_tunneled(auth_key: &str, target: &str) -> Result<AddressDescriptor, ParseError> {
  if auth_key.is_empty() {
    return Err(ParseError::Malformed("empty authentication key"));
  }
  if auth_key.len() > MAX_AUTH_KEY_LENGTH {
    return Err(ParseError::Malformed("authentication key is too long"));
  }
  let segments: Vec<&str> = target.splitn(3, '/').collect();
  let (gateway, destination) = match segments.as_slice() {
    [gateway_host, gateway_port, destination] => {
      let port = parse_port(gateway_port).map_err(ParseError::Malformed)?;
      let host = gateway_host_segment(gateway_host).map_err(ParseError::Malformed)?;
      (HostAndPort::new(host, port), *destination)
    }
    [gateway, destination] => {
      let gateway = split_host_port(gateway, None).map_err(ParseError::Malformed)?;
      (gateway, *destination)
    }
    _ => return Err(ParseError::Malformed("missing gateway port")),
  };
  let destination = destination.trim();
  if destination.is_empty() {
    return Err(ParseError::Malformed("empty destination host"));
  }
  let destination =
    split_host_port(destination, Some(DEFAULT_GAME_PORT)).map_err(ParseError::Malformed)?;
  Ok(AddressDescriptor::tunneled(
    destination,
    gateway,
    AuthKey::from(auth_key),
  ))
}

/// Accepts exactly what [`parse`] accepts, then additionally requires every host to survive
/// IDNA conversion to its ASCII form
pub fn is_valid(input: &str) -> bool {
  let descriptor = match parse(input) {
    Ok(descriptor) => descriptor,
    Err(_) => return false,
  };
  std::iter::once(descriptor.destination())
    .chain(descriptor.gateway())
    .all(|host| {
      let formatted = if host.is_ipv6_literal() {
        format!("[{}]", host.host())
      } else {
        host.host().to_string()
      };
      url::Host::parse(&formatted).is_ok()
    })
}

fn split_host_port(input: &str, default_port: Option<u16>) -> Result<HostAndPort, &'static str> {
  let (host, port) = if let Some(bracketed) = input.strip_prefix('[') {
    let (host, remainder) = bracketed
      .split_once(']')
      .ok_or("unterminated IPv6 literal")?;
    host
      .parse::<Ipv6Addr>()
      .map_err(|_| "bracketed host is not an IPv6 address")?;
    let port = match remainder {
      "" => None,
      _ => Some(
        remainder
          .strip_prefix(':')
          .ok_or("unexpected characters after IPv6 literal")?,
      ),
    };
    return Ok(HostAndPort::new(host, resolve_port(port, default_port)?));
  } else {
    match input.matches(':').count() {
      0 => (input, None),
      1 => match input.split_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (input, None),
      },
      _ => {
        input
          .parse::<Ipv6Addr>()
          .map_err(|_| "too many colons in host")?;
        return Ok(HostAndPort::new(input, resolve_port(None, default_port)?));
      }
    }
  };
  validate_host(host)?;
  Ok(HostAndPort::new(host, resolve_port(port, default_port)?))
}

/// The gateway host of the slash-separated form: a name, or an IPv6 literal with or without brackets
fn gateway_host_segment(segment: &str) -> Result<&str, &'static str> {
  let (host, bracketed) = match segment.strip_prefix('[') {
    Some(inner) => (inner.strip_suffix(']').ok_or("unterminated IPv6 literal")?, true),
    None => (segment, false),
  };
  if bracketed || host.contains(':') {
    host
      .parse::<Ipv6Addr>()
      .map_err(|_| "gateway host is not an IPv6 address")?;
  } else {
    validate_host(host)?;
  }
  Ok(host)
}

fn resolve_port(port: Option<&str>, default_port: Option<u16>) -> Result<u16, &'static str> {
  match (port, default_port) {
    (Some(port), _) => parse_port(port),
    (None, Some(default_port)) => Ok(default_port),
    (None, None) => Err("missing port"),
  }
}

fn parse_port(port: &str) -> Result<u16, &'static str> {
  if port.is_empty() || port.len() > 5 || !port.bytes().all(|b| b.is_ascii_digit()) {
    return Err("port is not a number");
  }
  match port.parse::<u32>() {
    Ok(port @ 1..=65535) => Ok(port as u16),
    _ => Err("port out of range"),
  }
}

fn validate_host(host: &str) -> Result<(), &'static str> {
  if host.is_empty() {
    return Err("empty host");
  }
  if host.len() > MAX_DESTINATION_HOST_LENGTH {
    return Err("host is too long");
  }
  if host
    .chars()
    .any(|c| c.is_whitespace() || c.is_control() || FORBIDDEN_HOST_CHARACTERS.contains(&c))
  {
    return Err("host contains forbidden characters");
  }
  Ok(())
}
