//! HTTP remote-function endpoint that resolves batches of effective Org
//! Policies through [`effpol_core`].

pub mod config;
pub mod error;
pub mod orgpolicy;
pub mod server;

pub use config::EffpolConfig;
pub use error::ConfigError;
pub use server::{AppState, router, serve};
