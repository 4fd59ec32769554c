//! webproxy: filtering, caching forward HTTP/HTTPS proxy
//!
//! This crate provides a forward proxy that sits between local clients and
//! the web. It blocks destinations by host, path prefix or wildcard, caches
//! plain HTTP responses, and tunnels HTTPS through CONNECT.
//!
//! # Policy Model
//!
//! The policy is **fail-open**: a destination no rule matches is allowed.
//! The most specific matching rule decides, so an allow rule can carve an
//! exception out of a broader block.
//!
//! # Architecture
//!
//! - **HTTP**: Codec for HTTP/1.x heads and bodies
//! - **Cache**: LRU response store with freshness and revalidation
//! - **Proxy**: Accept loop, dispatcher, response pipeline and tunnel relay
//! - **Config**: Hierarchical TOML configuration with embedded defaults
//! - **Telemetry**: Structured syslog logging for audit trails
//! - **Control**: Unix socket IPC for runtime rule and cache management

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod cache;
pub mod cli;
pub mod cli_handler;
pub mod config;
pub mod control;
pub mod http;
pub mod orchestrator;
pub mod proxy;
pub mod telemetry;
