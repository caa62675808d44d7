// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use quicgate::client::TunnelContext;
use quicgate::common::AddressDescriptor;
use quicgate::transport::{self, ContextConfig};
use std::path::PathBuf;

#[derive(Clone, Debug)]
pub struct ClientArgs {
  pub authority_cert: Option<PathBuf>,
  pub descriptor: AddressDescriptor,
  pub config: ContextConfig,
}

fn trust_roots(authority_cert: Option<&PathBuf>) -> Result<rustls::RootCertStore> {
  match authority_cert {
    Some(path) => Ok(transport::root_store_from(
      &transport::load_certificate_chain(path)?,
    )),
    None => {
      let native = rustls_native_certs::load_native_certs()
        .context("Failed loading platform root certificates")?;
      let native: Vec<rustls::Certificate> = native
        .into_iter()
        .map(|certificate| rustls::Certificate(certificate.0))
        .collect();
      Ok(transport::root_store_from(&native))
    }
  }
}

/// Open one tunnel session and keep it until interrupted or closed by either end
#[tracing::instrument(skip(args), fields(destination = %args.descriptor.destination()), err)]
pub async fn client_main(args: ClientArgs) -> Result<()> {
  let roots = trust_roots(args.authority_cert.as_ref())?;
  let context = TunnelContext::create(args.config, roots)?;
  let opened = context
    .open_session(&args.descriptor)
    .await
    .context("Failed to open tunnel session");
  let session = match opened.map(|id| context.session(id)) {
    Ok(Some(session)) => session,
    Ok(None) => {
      context.close().await;
      return Err(anyhow::Error::msg("Session closed before it could be used"));
    }
    Err(error) => {
      context.close().await;
      return Err(error);
    }
  };

  tracing::info!(
    local_port = session.local_port(),
    gateway = %session.gateway_address(),
    "Tunnel ready; point the game at the local port"
  );
  println!("{}", session.local_port());

  tokio::select! {
    _ = tokio::signal::ctrl_c() => {
      tracing::trace!("SIGINT detected, closing tunnel");
    }
    _ = session.closed() => {
      tracing::info!("Tunnel closed");
    }
  }
  context.close().await;
  Ok(())
}
