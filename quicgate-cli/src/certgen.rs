// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use std::path::{Path, PathBuf};
use tracing::instrument;

pub struct GeneratedCertificate {
  pub certificate: rustls::Certificate,
  pub private_key: rustls::PrivateKey,
  pub public_pem: String,
  pub private_pem: String,
}

pub fn generate(subject_alt_names: Vec<String>) -> Result<GeneratedCertificate> {
  let cert = rcgen::generate_simple_self_signed(subject_alt_names)
    .context("Certificate generation failed")?;
  Ok(GeneratedCertificate {
    certificate: rustls::Certificate(cert.serialize_der()?),
    private_key: rustls::PrivateKey(cert.serialize_private_key_der()),
    public_pem: cert.serialize_pem()?,
    private_pem: cert.serialize_private_key_pem(),
  })
}

fn with_suffix(path: &Path, suffix: &str) -> Result<PathBuf> {
  let name = path
    .file_name()
    .and_then(|name| name.to_str())
    .ok_or_else(|| anyhow::Error::msg("Certificate path must end in a UTF-8 file name"))?;
  Ok(path.with_file_name(format!("{}{}", name, suffix)))
}

#[instrument]
pub async fn certgen_main(output_base_path: String, subject_alt_names: Vec<String>) -> Result<()> {
  use std::fs;
  let path = PathBuf::from(output_base_path);
  if let Some(parent) = path.parent() {
    fs::create_dir_all(parent).context("Directory creation must succeed for certs")?;
  }
  let generated = generate(subject_alt_names)?;
  fs::write(with_suffix(&path, ".pub.pem")?, &generated.public_pem)
    .context("Failed writing public key")?;
  fs::write(with_suffix(&path, ".priv.pem")?, &generated.private_pem)
    .context("Failed writing private key")?;
  Ok(())
}
