//! NBD server: fixed newstyle negotiation and read-only transmission.

mod connection;
mod exports;
mod listener;
mod server;

pub use connection::{serve, SERVER_FLAGS, TRANSMISSION_FLAGS};
pub use exports::{Exports, StaticExports};
pub use listener::{Listener, StreamListener};
pub use server::{NbdServer, CONN_ACCEPT_TIMEOUT, GRACEFUL_SHUTDOWN_TIMEOUT};
