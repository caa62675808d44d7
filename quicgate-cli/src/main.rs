// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use anyhow::Result;
use clap::{Arg, ArgMatches, Command};
use quicgate::common::address;
use quicgate::common::authentication::{AllowListPolicy, AuthenticationPolicy, SharedSecretPolicy};
use quicgate::transport::{ContextConfig, GatewayConfig};
use quicgate::util::validators::{
  parse_port, parse_seconds, parse_socketaddr, validate_existing_file, validate_port,
  validate_seconds, validate_socketaddr, validate_tunnel_descriptor,
};
use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

mod certgen;
mod client;
mod gateway;

fn main() -> Result<()> {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("quinn=warn,quinn_proto=warn,info"));
  let collector = tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .finish();
  tracing::subscriber::set_global_default(collector)?;
  let app = Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .subcommand(
      Command::new("client")
        .alias("-c")
        .about("Open one tunnel session and expose it on a local port")
        .arg(
          Arg::new("descriptor")
            .help("quic://<authKey>@<gatewayHost>/<gatewayPort>/<destination>[:<port>]")
            .validator(validate_tunnel_descriptor)
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("authority")
            .help("Certificate to trust for the gateway instead of the platform roots")
            .long("authority")
            .short('a')
            .validator(validate_existing_file)
            .takes_value(true)
            .required(false),
        )
        .arg(
          Arg::new("config")
            .long("config")
            .validator(validate_existing_file)
            .takes_value(true)
            .required(false),
        )
        .arg(
          Arg::new("connect-timeout")
            .help("Seconds to wait for the gateway handshake")
            .long("connect-timeout")
            .validator(validate_seconds)
            .takes_value(true)
            .required(false),
        ),
    )
    .subcommand(
      Command::new("gateway")
        .alias("-g")
        .about("Accept tunnel clients and relay them to their destinations")
        .arg(
          Arg::new("cert")
            .long("cert")
            .short('c')
            .validator(validate_existing_file)
            .takes_value(true)
            .requires("key")
            .required_unless_present("self-signed-cert"),
        )
        .arg(
          Arg::new("key")
            .long("key")
            .short('k')
            .validator(validate_existing_file)
            .takes_value(true)
            .requires("cert"),
        )
        .arg(
          Arg::new("self-signed-cert")
            .help("Generate a throwaway certificate; its PEM is printed for clients to trust")
            .long("self-signed-cert")
            .conflicts_with_all(&["cert", "key"])
            .takes_value(false),
        )
        .arg(
          Arg::new("san")
            .help("Subject alternative name for the generated certificate")
            .long("san")
            .takes_value(true)
            .multiple_occurrences(true)
            .default_value("localhost"),
        )
        .arg(
          Arg::new("auth-key")
            .help("Accepted client key; an Argon2 PHC string is verified as a hash")
            .long("auth-key")
            .takes_value(true)
            .multiple_occurrences(true)
            .required(true),
        )
        .arg(
          Arg::new("bind")
            .long("bind")
            .short('b')
            .validator(validate_socketaddr)
            .takes_value(true)
            .required(false),
        )
        .arg(
          Arg::new("port")
            .help("Port to accept tunnels on; overrides the port of --bind")
            .long("port")
            .short('p')
            .validator(validate_port)
            .takes_value(true)
            .required(false),
        )
        .arg(
          Arg::new("dial-timeout")
            .help("Seconds to wait for each destination to accept")
            .long("dial-timeout")
            .validator(validate_seconds)
            .takes_value(true)
            .required(false),
        )
        .arg(
          Arg::new("config")
            .long("config")
            .validator(validate_existing_file)
            .takes_value(true)
            .required(false),
        ),
    )
    .subcommand(
      Command::new("cert")
        .about("Generate self-signed certificates for local usage")
        .arg(Arg::new("path").takes_value(true).required(true))
        .arg(
          Arg::new("san")
            .long("san")
            .takes_value(true)
            .multiple_occurrences(true)
            .required(false)
            .default_value("localhost"),
        ),
    )
    .subcommand(
      Command::new("hash-key")
        .about("Print an Argon2 hash of a key, for use as a gateway --auth-key")
        .arg(Arg::new("key").takes_value(true).required(true)),
    )
    .subcommand_required(true)
    .arg_required_else_help(true);
  let matches = app.get_matches();
  let mode = matches.subcommand_name().unwrap_or("<No subcommand?>");
  let handler = main_args_handler(&matches);
  let rt = tokio::runtime::Builder::new_multi_thread()
    .thread_name("tokio-reactor-worker")
    .enable_all()
    .build()?;
  match rt.block_on(handler) {
    Err(err) => {
      tracing::error!(mode = mode, err = ?err, "dispatch_command_failure");
      Err(err)
    }
    Ok(_) => {
      tracing::info!("{} exited successfully", mode);
      Ok(())
    }
  }
}

fn read_config<T: serde::de::DeserializeOwned + Default>(args: &ArgMatches) -> Result<T> {
  match args.value_of("config") {
    Some(path) => {
      let contents = std::fs::read(path)?;
      Ok(serde_json::from_slice(&contents)?)
    }
    None => Ok(T::default()),
  }
}

pub fn client_arg_handling(args: &'_ ArgMatches) -> Result<client::ClientArgs> {
  let mut config: ContextConfig = read_config(args)?;
  if let Some(timeout) = args.value_of("connect-timeout") {
    config.connect_timeout = parse_seconds(timeout)?;
  }
  let descriptor = args
    .value_of("descriptor")
    .ok_or_else(|| anyhow::Error::msg("Descriptor argument is required"))?;
  Ok(client::ClientArgs {
    authority_cert: args.value_of("authority").map(PathBuf::from),
    descriptor: address::parse(descriptor)?,
    config,
  })
}

pub fn gateway_arg_handling(args: &'_ ArgMatches) -> Result<gateway::GatewayArgs> {
  let mut config: GatewayConfig = read_config(args)?;
  if let Some(bind) = args.value_of("bind") {
    config.bind_address = parse_socketaddr(bind)?;
  }
  if let Some(port) = args.value_of("port") {
    config.bind_address.set_port(parse_port(port)?);
  }
  if let Some(timeout) = args.value_of("dial-timeout") {
    config.dial_timeout = parse_seconds(timeout)?;
  }

  let tls = match (args.value_of("cert"), args.value_of("key")) {
    (Some(cert), Some(key)) => gateway::TlsSource::Files {
      cert: Path::new(cert).to_path_buf(),
      key: Path::new(key).to_path_buf(),
    },
    _ => gateway::TlsSource::SelfSigned {
      subject_alt_names: args
        .values_of("san")
        .map(|sans| sans.map(String::from).collect())
        .unwrap_or_default(),
    },
  };

  let keys: Vec<&str> = args
    .values_of("auth-key")
    .map(Iterator::collect)
    .unwrap_or_default();
  let policy: Arc<dyn AuthenticationPolicy> = match keys.as_slice() {
    [] => return Err(anyhow::Error::msg("At least one --auth-key is required")),
    [secret] => {
      let policy = SharedSecretPolicy::from_configured(secret);
      if !policy.is_hashed() {
        tracing::warn!("Using a plaintext authentication key; consider `hash-key` to store a hash");
      }
      Arc::new(policy)
    }
    several => {
      if several
        .iter()
        .any(|secret| SharedSecretPolicy::from_configured(secret).is_hashed())
      {
        return Err(anyhow::Error::msg(
          "Hashed keys cannot be combined with other keys; pass a single hashed --auth-key",
        ));
      }
      tracing::warn!(keys = several.len(), "Using plaintext authentication keys");
      Arc::new(AllowListPolicy::new(several.iter().copied()))
    }
  };

  Ok(gateway::GatewayArgs {
    config,
    tls,
    policy,
  })
}

async fn main_args_handler(matches: &'_ ArgMatches) -> Result<()> {
  match matches.subcommand() {
    Some(("gateway", opts)) => {
      let args = gateway_arg_handling(opts)?;
      tracing::info!("Running as gateway with config {:#?}", args);
      gateway::gateway_main(args).await
    }
    Some(("client", opts)) => {
      let args = client_arg_handling(opts)?;
      tracing::info!("Running as client with config {:#?}", args);
      client::client_main(args).await
    }
    Some(("cert", opts)) => {
      tracing::info!("Generating certs...");
      let path_raw = opts
        .value_of("path")
        .ok_or_else(|| anyhow::Error::msg("Path argument is required"))?;
      let sans = opts
        .values_of("san")
        .map(|sans| sans.map(String::from).collect())
        .unwrap_or_default();
      certgen::certgen_main(path_raw.into(), sans).await
    }
    Some(("hash-key", opts)) => {
      let key = opts
        .value_of("key")
        .ok_or_else(|| anyhow::Error::msg("Key argument is required"))?;
      println!("{}", gateway::hash_key(key)?);
      Ok(())
    }
    _ => Err(anyhow::Error::msg("Unknown subcommand")),
  }
}
