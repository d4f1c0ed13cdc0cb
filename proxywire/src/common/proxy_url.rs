// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Proxy URL interpretation: credentials, proxy address, and scheme default ports

use url::Url;

use super::{dialer::Auth, error::ConfigurationError};
use crate::util::join_host_port;

/// The port a proxy scheme listens on when its URL names none
pub fn default_port(scheme: &str) -> Option<u16> {
  match scheme {
    "socks" | "socks5" | "socks4" | "socks4a" => Some(1080),
    "http" | "http+post" => Some(80),
    "https" | "https+h2" | "https+post" => Some(443),
    "ssh" | "ssh2" => Some(22),
    _ => None,
  }
}

/// Extracts percent-decoded credentials from the URL's userinfo, if a username is present
pub fn auth_from_url(url: &Url) -> Result<Option<Auth>, ConfigurationError> {
  if url.username().is_empty() {
    return Ok(None);
  }
  let decode = |raw: &str| {
    urlencoding::decode(raw)
      .map(|s| s.into_owned())
      .map_err(|e| ConfigurationError::MalformedUrl {
        url: redacted(url),
        reason: format!("userinfo is not valid UTF-8: {}", e),
      })
  };
  let mut auth = Auth::new(decode(url.username())?);
  if let Some(password) = url.password() {
    auth = auth.with_password(decode(password)?);
  }
  Ok(Some(auth))
}

/// The `host:port` of the proxy named by `url`, applying the scheme's default port
pub fn proxy_address(url: &Url) -> Result<String, ConfigurationError> {
  let host = url
    .host_str()
    .filter(|h| !h.is_empty())
    .ok_or_else(|| ConfigurationError::MalformedUrl {
      url: redacted(url),
      reason: String::from("proxy URL has no host"),
    })?;
  let scheme = url.scheme().to_ascii_lowercase();
  let port = url
    .port()
    .or_else(|| default_port(&scheme))
    .or_else(|| url.port_or_known_default())
    .ok_or_else(|| ConfigurationError::MalformedUrl {
      url: redacted(url),
      reason: format!("no port given and scheme {:?} has no default", scheme),
    })?;
  Ok(join_host_port(host, port))
}

/// Renders a URL with any password masked, for logs and error messages
pub fn redacted(url: &Url) -> String {
  if url.password().is_none() {
    return url.to_string();
  }
  let mut masked = url.clone();
  match masked.set_password(Some("xxxxx")) {
    Ok(()) => masked.to_string(),
    Err(()) => format!("{}://{}", url.scheme(), url.host_str().unwrap_or_default()),
  }
}
