// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use proxywire::{
  common::{per_host::PerHost, proxy_url::redacted},
  ArcDialer, Direct, SchemeRegistry, SystemResolver,
};
use serde::Deserialize;
use std::{path::Path, sync::Arc};

/// Settings read from the optional JSON configuration file
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
  pub proxy: Option<String>,
  pub no_proxy: Option<String>,
  pub keepalive_interval_secs: Option<u64>,
  pub connect_timeout_secs: Option<u64>,
}

impl ConfigFile {
  pub fn load(path: &Path) -> Result<Self> {
    let raw = std::fs::read_to_string(path)
      .with_context(|| format!("Failed reading config file {}", path.display()))?;
    Self::parse(&raw).with_context(|| format!("Invalid config file {}", path.display()))
  }

  pub fn parse(raw: &str) -> Result<Self> {
    Ok(serde_json::from_str(raw)?)
  }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProxyArgs {
  pub proxy: Option<String>,
  pub config: Option<ConfigFile>,
}

/// Chooses the dialer for a command: `--proxy` first, then the config file, then the environment
pub fn select_dialer(args: &ProxyArgs, registry: &SchemeRegistry) -> Result<ArcDialer> {
  let file = args.config.clone().unwrap_or_default();
  let proxy = match args.proxy.as_ref().or(file.proxy.as_ref()) {
    Some(proxy) => proxy,
    None => {
      tracing::debug!("No proxy given; consulting the environment");
      return Ok(proxywire::from_environment(registry));
    }
  };
  let mut url = url::Url::parse(proxy).context("Invalid proxy URL")?;
  apply_tunnel_settings(&mut url, &file);
  let dialer = registry
    .from_url(&url, Direct::shared(), SystemResolver::shared())
    .with_context(|| format!("Unusable proxy {}", redacted(&url)))?;
  tracing::info!(proxy = %redacted(&url), "Using proxy");
  Ok(match file.no_proxy.as_deref().filter(|s| !s.trim().is_empty()) {
    Some(no_proxy) => {
      let mut per_host = PerHost::new(dialer, Direct::shared());
      per_host.add_from_str(no_proxy);
      Arc::new(per_host)
    }
    None => dialer,
  })
}

/// Carries tunnel timing from the config file into SSH proxy URLs which don't set it themselves
fn apply_tunnel_settings(url: &mut url::Url, file: &ConfigFile) {
  if !matches!(url.scheme(), "ssh" | "ssh2") {
    return;
  }
  let settings = [
    ("keepalive_interval", file.keepalive_interval_secs),
    ("connect_timeout", file.connect_timeout_secs),
  ];
  for (name, value) in settings {
    let value = match value {
      Some(value) => value,
      None => continue,
    };
    if url.query_pairs().any(|(key, _)| key == name) {
      continue;
    }
    url
      .query_pairs_mut()
      .append_pair(name, &value.to_string());
  }
}
