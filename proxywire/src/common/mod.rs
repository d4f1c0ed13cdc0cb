// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod dialer;
pub mod direct;
pub mod environment;
pub mod error;
pub mod per_host;
pub mod protocol;
pub mod proxy_url;
pub mod registry;
pub mod ssh;
