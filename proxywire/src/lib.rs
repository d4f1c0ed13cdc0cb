// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Proxy dialers: direct, SOCKS, HTTP CONNECT, HTTP-POST tunnels, and persistent SSH tunnels
//!
//! Dialers are described by proxy URLs and built through a [`common::registry::SchemeRegistry`].

pub mod common;
pub mod util;

pub use common::{
  dialer::{ArcDialer, ArcResolver, Auth, Dialer, Network, Resolver, SystemResolver},
  direct::Direct,
  environment::from_environment,
  error::DialerError,
  registry::SchemeRegistry,
};
