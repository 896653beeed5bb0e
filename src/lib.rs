//! Line-oriented TCP chat.
//!
//! Clients and the server exchange UTF-8 text, one message per `\n`
//! terminated line. The pieces, leaf first:
//!
//! - [`codec`] splits byte streams into [`codec::Line`]s.
//! - [`connection`] drives one socket and reports lines, close and failure
//!   as ordered events.
//! - [`registry`] is the server's set of open connections, used for
//!   broadcast.
//! - [`prompt`] reads operator input on the client without blocking
//!   inbound output.
//! - [`server`] and [`client`] wire those into the two binaries.

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod prompt;
pub mod registry;
pub mod server;

/// Installs the fmt subscriber on stderr. `RUST_LOG` overrides `level`.
pub fn init_tracing(level: &str) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
