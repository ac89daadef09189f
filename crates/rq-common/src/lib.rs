//! ---
//! rq_section: "01-core-functionality"
//! rq_subsection: "module"
//! rq_type: "source"
//! rq_scope: "code"
//! rq_description: "Shared primitives and utilities for the broker runtime."
//! rq_version: "v0.0.0-prealpha"
//! rq_owner: "tbd"
//! ---
//! Core shared primitives for the R-MQ workspace.
//! This crate exposes configuration loading and tracing bootstrap
//! utilities consumed by the broker and its host applications.

pub mod config;
pub mod logging;

pub use config::{AppConfig, BrokerConfig, LoggingConfig, RpcErrorPolicy, RpcStrategy};
pub use logging::{init_tracing, LogFormat};
