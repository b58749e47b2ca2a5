//! LSP endpoints over UDP

pub mod client;
pub mod connection;
mod pool;
pub mod server;
pub mod socket;

pub use client::Client;
pub use connection::{Connection, ConnectionState};
pub use pool::MAX_CONNECTIONS;
pub use server::Server;
pub use socket::LspSocket;
