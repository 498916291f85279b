//! SSH piping daemon.
//!
//! Reads a TOML config, loads host keys and routing files once, and runs a
//! [`Supervisor`](piper_proto::ssh::piper::Supervisor) until Ctrl-C.

#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod cli;
pub mod config;
pub mod daemon;
pub mod hostkeys;
pub mod logging;
pub mod routes;
