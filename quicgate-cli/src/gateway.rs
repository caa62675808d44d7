// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use argon2::password_hash::{rand_core::OsRng, PasswordHasher, SaltString};
use argon2::Argon2;
use quicgate::common::authentication::AuthenticationPolicy;
use quicgate::gateway::Gateway;
use quicgate::transport::{self, GatewayConfig};
use std::{path::PathBuf, sync::Arc};
use tokio_util::sync::CancellationToken;

use crate::certgen;

#[derive(Clone, Debug)]
pub enum TlsSource {
  Files { cert: PathBuf, key: PathBuf },
  SelfSigned { subject_alt_names: Vec<String> },
}

/// Parameters used to run a quicgate gateway
#[derive(Clone, Debug)]
pub struct GatewayArgs {
  pub config: GatewayConfig,
  pub tls: TlsSource,
  pub policy: Arc<dyn AuthenticationPolicy>,
}

/// Run a gateway until interrupted, then close every live tunnel
#[tracing::instrument(skip(args), fields(bind = %args.config.bind_address), err)]
pub async fn gateway_main(args: GatewayArgs) -> Result<()> {
  let (chain, key) = match &args.tls {
    TlsSource::Files { cert, key } => (
      transport::load_certificate_chain(cert)?,
      transport::load_private_key(key)?,
    ),
    TlsSource::SelfSigned { subject_alt_names } => {
      let generated = certgen::generate(subject_alt_names.clone())?;
      tracing::warn!("Using a self-signed certificate; clients must pass it as --authority");
      println!("{}", generated.public_pem);
      (vec![generated.certificate], generated.private_key)
    }
  };
  let server_config = transport::server_config(chain, key, &args.config)?;
  let gateway = Gateway::bind(server_config, args.config, args.policy)?;
  tracing::info!(addr = ?gateway.local_addr()?, "Gateway listening");

  let (shutdown, sigint_handler_task) = {
    let shutdown = CancellationToken::new();
    let shutdown_trigger = shutdown.clone();
    let sigint_handler_task = tokio::task::spawn(async move {
      let _ = tokio::signal::ctrl_c().await;
      tracing::trace!("SIGINT detected, initiating graceful shutdown");
      shutdown_trigger.cancel();
    });
    (shutdown, sigint_handler_task)
  };

  gateway.run(shutdown).await;

  sigint_handler_task.abort();
  let _cancelled = sigint_handler_task.await;
  Ok(())
}

/// Argon2 PHC string for `key` with a fresh random salt
pub fn hash_key(key: &str) -> Result<String> {
  let salt = SaltString::generate(&mut OsRng);
  let hash = Argon2::default()
    .hash_password(key.as_bytes(), &salt)
    .map_err(|error| anyhow::Error::msg(error.to_string()))
    .context("Hashing the key failed")?;
  Ok(hash.to_string())
}
