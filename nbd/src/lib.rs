//! NBD (Network Block Device) protocol implementation.
//!
//! This crate provides a pure Rust implementation of the read-only subset of
//! the NBD protocol used by s3bd: wire constants, fixed-size frames and an
//! async client.
//!
//! Based on https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md

mod client;
mod protocol;

pub use client::{NbdClient, client_handshake, export_request, read_option_reply, send_option};
pub use protocol::*;
