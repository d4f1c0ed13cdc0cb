// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::net::SocketAddr;
use std::path::Path;

pub fn validate_existing_file(v: &str) -> Result<(), String> {
  if !Path::new(&v).exists() {
    Err(String::from("A file must exist at the given path"))
  } else {
    Ok(())
  }
}

pub fn parse_socketaddr(v: &str) -> Result<SocketAddr, std::net::AddrParseError> {
  v.parse::<SocketAddr>()
}

pub fn validate_socketaddr(v: &str) -> Result<(), String> {
  parse_socketaddr(v).map(|_| ()).map_err(|e| e.to_string())
}

/// Accepts `host:port` destinations, where host may be a name or a bracketed IPv6 literal
pub fn validate_host_port(v: &str) -> Result<(), String> {
  super::split_host_port(v)
    .map(|_| ())
    .map_err(|e| e.to_string())
}

pub fn validate_proxy_url(v: &str) -> Result<(), String> {
  url::Url::parse(v).map(|_| ()).map_err(|e| e.to_string())
}
