// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Error as AnyErr, Result};
use std::net::SocketAddr;
use std::path::Path;

use crate::common::address;

pub fn validate_existing_file(v: &str) -> Result<(), String> {
  if !Path::new(&v).exists() {
    Err(String::from("A file must exist at the given path"))
  } else {
    Ok(())
  }
}

pub fn parse_socketaddr(v: &str) -> Result<SocketAddr> {
  use std::net::ToSocketAddrs;
  ToSocketAddrs::to_socket_addrs(v)
    .map_err(AnyErr::from)
    .and_then(|mut items| {
      items
        .next()
        .ok_or_else(|| AnyErr::msg("No addresses were resolved from the given host"))
    })
}

pub fn validate_socketaddr(v: &str) -> Result<(), String> {
  parse_socketaddr(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn parse_port(v: &str) -> Result<u16> {
  match v.parse::<u16>() {
    Ok(0) => Err(AnyErr::msg("Port must be between 1 and 65535")),
    Ok(port) => Ok(port),
    Err(_) => Err(AnyErr::msg("Port must be between 1 and 65535")),
  }
}

pub fn validate_port(v: &str) -> Result<(), String> {
  parse_port(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn parse_seconds(v: &str) -> Result<std::time::Duration> {
  v.parse::<u64>()
    .map(std::time::Duration::from_secs)
    .map_err(|_| AnyErr::msg("Expected a whole number of seconds"))
}

pub fn validate_seconds(v: &str) -> Result<(), String> {
  parse_seconds(v).map(|_| ()).map_err(|e| e.to_string())
}

/// Accepts tunnel descriptors only; direct addresses have nothing to tunnel
pub fn validate_tunnel_descriptor(v: &str) -> Result<(), String> {
  match address::parse(v) {
    Ok(descriptor) if descriptor.is_tunneled() => Ok(()),
    Ok(_) => Err(String::from(
      "Expected quic://<authKey>@<gatewayHost>/<gatewayPort>/<destinationHost>[:<destinationPort>]",
    )),
    Err(e) => Err(e.to_string()),
  }
}
