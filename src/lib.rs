//! Mirra
//!
//! Continuous file-backup service: a client watches a directory and
//! mirrors its regular files to a per-user tree on the server over
//! mutually-authenticated TLS, using a length-prefixed TLV protocol.

pub mod cli;
pub mod connection;
pub mod digest;
pub mod dir_view;
pub mod handler;
pub mod logger;
pub mod message;
pub mod protocol;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod tls;
pub mod watcher;
