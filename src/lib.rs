//! Shaper - connection level traffic shaping for proxies
//!
//! This crate throttles the read and write throughput of established stream
//! and datagram connections against per-tag, per-user and per-inbound
//! bandwidth budgets, and enforces idle timeouts on them. Limiters are built
//! once from configuration into a [`LimiterRegistry`]; each new connection
//! is resolved against it and wrapped before it enters the proxy pipeline.
//!
//! [`LimiterRegistry`]: ratelimit::LimiterRegistry

pub mod config;
pub mod conn;
pub mod error;
pub mod ratelimit;
pub mod relay;
