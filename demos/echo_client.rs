//! LSP Echo Client Example
//!
//! Sends each line read from stdin to the echo server and prints the reply.
//!
//! ```text
//! cargo run --example echo_client -- [host] [port] [params.json]
//! ```

use std::error::Error;
use tokio::io::{self, AsyncBufReadExt};
use tracing::info;
use lsp::{Client, Params};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    let port: u16 = match args.next() {
        Some(port) => port.parse()?,
        None => 6969,
    };
    let params = match args.next() {
        Some(path) => Params::from_json(&std::fs::read_to_string(path)?)?,
        None => Params::default(),
    };

    let client = Client::connect(&host, port, params).await?;
    info!(
        "Connected to {}:{} as connection {:?}",
        host,
        port,
        client.conn_id()
    );

    let mut lines = io::BufReader::new(io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        client.write(line.into_bytes())?;
        match client.read().await? {
            Some(reply) => println!("{}", String::from_utf8_lossy(&reply)),
            None => {
                info!("Server stopped responding");
                return Ok(());
            }
        }
    }

    client.close().await?;
    Ok(())
}
