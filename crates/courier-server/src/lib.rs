//! Courier server assembly.
//!
//! The binary in `main.rs` is a thin wrapper around this library so the
//! server can also be embedded and driven end-to-end from tests: build an
//! [`handlers::AppState`] from a [`config::Config`], mount it with
//! [`handlers::app`], and start the background loops with [`tasks::spawn`].

pub mod config;
pub mod handlers;
pub mod metrics;
pub mod tasks;
