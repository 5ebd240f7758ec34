//! Betamax - HTTP record/replay proxy
//!
//! Requests pass through to an upstream while a cassette records them;
//! later runs replay the recorded episodes without contacting the upstream.
//! Cassettes are switched at runtime through the `/__betamax__/config`
//! endpoint on the proxy's own listener.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::cargo)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::cast_possible_truncation,
    clippy::field_reassign_with_default,
    clippy::multiple_crate_versions
)]

pub mod cassette;
pub mod config;
pub mod error;
pub mod form;
pub mod matcher;
pub mod network;
pub mod pipeline;
pub mod proxy;
pub mod tray;

pub use error::{BetamaxError, Result};
