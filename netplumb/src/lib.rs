// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Chained programming of per-connection dataplane state.
//!
//! A [`Chain`](common::chain::Chain) of [elements](common::chain::ChainElement) carries a
//! [`Connection`](common::connection::Connection) through `request` and `close`, with a
//! per-connection [metadata store](common::metadata) between the two and shared,
//! reference-counted [registries](common::registry) for resources several connections use.
#![warn(unused_imports)]

pub mod common;
pub mod config;
pub mod elements;
pub mod ext;
pub mod util;

#[cfg(test)]
mod scenarios;
