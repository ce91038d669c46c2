//! upswake kernel: UPS-aware Wake-on-LAN orchestration.
//!
//! Targets are woken only when the rules attached to them hold against live
//! telemetry from their NUT server. A per-target scheduler asks periodically;
//! the HTTP API lets operators ask on demand or wake unconditionally.

pub mod config;
pub mod evaluator;
pub mod http;
pub mod models;
pub mod net;
pub mod policy;
pub mod reload;
pub mod scheduler;
pub mod service;
pub mod state;
pub mod telemetry;
pub mod wol;
