use std::io::{Read, Write};

use anyhow::{Context, Result};
use conduit_common::config::ServerCertPath;
use conduit_server::{ServerTlsContext, TransportServer};
use tracing::warn;

/// Accepts a single TLS connection, greets the client and exits
fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    println!("=== Conduit Server Basic Example ===");

    let cert_path = ServerCertPath::new();
    println!("Certificate paths:");
    println!("  - Server cert: {:?}", cert_path.cert_path);
    println!("  - Server key: {:?}", cert_path.key_path);

    if !cert_path.cert_path.exists() {
        warn!("Server certificate not found at {:?}", cert_path.cert_path);
        println!("Skipping this example...");
        return Ok(());
    }

    let tls = ServerTlsContext::load(&cert_path).context("Failed to load server certificate")?;
    let server = TransportServer::installed(Some(tls))?;

    println!("Waiting for one TLS connection on port 9443...");
    let mut conn = server
        .wait_for_connection(9443, true)
        .context("Failed to accept connection")?;

    let info = conn.info()?;
    println!("✓ Accepted {} (secure: {}, peer: {:?})", info.handle, info.is_secure, info.peer_addr);

    conn.write_all(b"hello from conduit\n")?;
    let mut reply = String::new();
    conn.read_to_string(&mut reply)?;
    println!("Client said: {}", reply.trim_end());

    conn.close()?;
    println!("✓ Basic example completed");
    Ok(())
}
