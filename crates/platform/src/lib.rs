//! # Piper Platform
//!
//! Shared types for the SSH piping workspace.
//!
//! This crate provides the unified error type (`PiperError`, `PiperResult`)
//! used by the transport, the auth bridge and the daemon.
//!
//! # Examples
//!
//! ```
//! use piper_platform::{PiperError, PiperResult};
//!
//! fn route(user: &str) -> PiperResult<String> {
//!     if user.is_empty() {
//!         return Err(PiperError::Routing("empty user".to_string()));
//!     }
//!     Ok(format!("{}@backend", user))
//! }
//!
//! # fn main() -> PiperResult<()> {
//! assert_eq!(route("alice")?, "alice@backend");
//! assert!(route("").unwrap_err().is_recoverable());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;

pub use error::{PiperError, PiperResult};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
