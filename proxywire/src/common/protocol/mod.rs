// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod h2_connect;
pub mod http_connect;
pub mod http_tunnel;
pub mod socks;
pub mod tls;
