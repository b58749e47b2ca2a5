//! LSP Echo Server Example
//!
//! Sends every message back to the client it came from.
//!
//! ```text
//! cargo run --example echo_server -- [port] [params.json]
//! ```

use std::error::Error;
use tracing::{info, warn};
use lsp::{LspError, Params, Server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let port: u16 = match args.next() {
        Some(port) => port.parse()?,
        None => 6969,
    };
    let params = match args.next() {
        Some(path) => Params::from_json(&std::fs::read_to_string(path)?)?,
        None => Params::default(),
    };

    let server = Server::open(port, params).await?;
    info!("Echo server listening on {}", server.local_addr());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            pack = server.read() => {
                let pack = pack?;
                info!(
                    conn_id = pack.conn_id(),
                    "Echoing {} bytes",
                    pack.payload().len()
                );
                match server.write(pack) {
                    Ok(()) => {}
                    Err(e @ (LspError::QueueFull | LspError::ClosedConnection(_))) => {
                        warn!("Dropping echo: {}", e);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }

    info!("Shutting down with {} connections", server.connection_count());
    server.close_all().await;
    Ok(())
}
