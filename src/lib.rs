//! Arena Chat is a client for a chat service that streams answers from one
//! or two models side by side.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`core`] owns the session engine: frame decoding, per-channel stream
//!   reconciliation, the session store, regeneration, and the high-level
//!   [`core::client::ChatClient`].
//! - [`auth`] keeps credentials and gates every request behind a single
//!   in-flight credential refresh.
//! - [`api`] defines request/response payloads and endpoint paths.
//! - [`cli`] is the command-line front end.
//!
//! The binary (`src/main.rs`) routes through [`crate::cli::main`].

pub mod api;
pub mod auth;
pub mod cli;
pub mod core;
pub mod utils;
