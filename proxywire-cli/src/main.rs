// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use anyhow::{Context as AnyhowContext, Result};
use clap::{Arg, ArgMatches, Command};
use proxywire::{util::validators, SchemeRegistry};
use std::path::Path;
use tokio_util::sync::CancellationToken;

mod config;
mod connect;
mod forward;

fn proxy_args(command: Command<'static>) -> Command<'static> {
  command
    .arg(
      Arg::new("proxy")
        .long("proxy")
        .short('p')
        .help("Proxy URL, such as socks5://host:1080 or ssh://user@host?known_hosts=FILE")
        .validator(validators::validate_proxy_url)
        .takes_value(true),
    )
    .arg(
      Arg::new("config")
        .long("config")
        .short('c')
        .help("JSON file with proxy, no_proxy, keepalive_interval_secs and connect_timeout_secs")
        .validator(validators::validate_existing_file)
        .takes_value(true),
    )
}

fn main() {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("russh=warn,h2=warn,rustls=warn,info"));
  let collector = tracing_subscriber::fmt()
    .with_writer(std::io::stderr)
    .with_env_filter(env_filter)
    .finish();
  tracing::subscriber::set_global_default(collector).expect("Logger init must succeed");
  let app = Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .subcommand(
      proxy_args(Command::new("connect"))
        .about("Relay standard input and output through one connection to a target")
        .arg(
          Arg::new("target")
            .help("Destination as host:port")
            .validator(validators::validate_host_port)
            .takes_value(true)
            .required(true),
        ),
    )
    .subcommand(
      proxy_args(Command::new("forward"))
        .about("Accept local TCP connections and bridge each to a target")
        .arg(
          Arg::new("listen")
            .long("listen")
            .short('l')
            .validator(validators::validate_socketaddr)
            .default_value("127.0.0.1:8080")
            .takes_value(true),
        )
        .arg(
          Arg::new("target")
            .long("target")
            .short('t')
            .help("Destination as host:port")
            .validator(validators::validate_host_port)
            .takes_value(true)
            .required(true),
        ),
    )
    .subcommand_required(true)
    .arg_required_else_help(true);
  let matches = app.get_matches();
  let mode = matches.subcommand_name().unwrap_or("<No subcommand?>");
  let handler = main_args_handler(&matches);
  let rt = tokio::runtime::Builder::new_multi_thread()
    .thread_name("tokio-reactor-worker")
    .enable_all()
    .build()
    .expect("Tokio Runtime setup failure");
  match rt.block_on(handler) {
    Err(err) => {
      tracing::error!(mode = mode, err = ?err, "dispatch_command_failure");
      std::process::exit(1);
    }
    Ok(_) => tracing::info!("{} exited successfully", mode),
  }
}

fn proxy_arg_handling(args: &ArgMatches) -> Result<config::ProxyArgs> {
  let config = args
    .value_of("config")
    .map(|path| config::ConfigFile::load(Path::new(path)))
    .transpose()?;
  Ok(config::ProxyArgs {
    proxy: args.value_of("proxy").map(String::from),
    config,
  })
}

async fn main_args_handler(matches: &'_ ArgMatches) -> Result<()> {
  let registry = SchemeRegistry::with_builtins();
  match matches
    .subcommand()
    .expect("Subcommand is marked as required")
  {
    ("connect", opts) => {
      let dialer = config::select_dialer(&proxy_arg_handling(opts)?, &registry)?;
      let args = connect::ConnectArgs {
        target: opts
          .value_of("target")
          .context("Target argument is required")?
          .to_string(),
      };
      connect::connect_main(dialer, args).await
    }
    ("forward", opts) => {
      let dialer = config::select_dialer(&proxy_arg_handling(opts)?, &registry)?;
      let args = forward::ForwardArgs {
        listen: validators::parse_socketaddr(
          opts
            .value_of("listen")
            .context("Listen argument has a default")?,
        )?,
        target: opts
          .value_of("target")
          .context("Target argument is required")?
          .to_string(),
      };
      let stop_accepting = CancellationToken::new();
      tokio::spawn({
        let stop_accepting = stop_accepting.clone();
        async move {
          if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted; no longer accepting connections");
          }
          stop_accepting.cancel();
        }
      });
      forward::forward_main(dialer, args, stop_accepting).await
    }
    (_, _) => unreachable!(),
  }
}
