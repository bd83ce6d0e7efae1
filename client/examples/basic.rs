use std::io::{Read, Write};

use anyhow::{Context, Result};
use conduit_client::{
    is_reliable, max_message_size, resolve_v4, AddressTarget, ClientCertPath, ClientTlsContext,
    TransportClient,
};

/// Talks to the echo server example (`cargo run -p conduit-server --example
/// echo`), plain first and then over TLS when certificates are available
fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    println!("=== Conduit Client Basic Example ===");

    println!("\n1. Plain connection:");
    example_plain()?;

    println!("\n2. TLS connection:");
    example_tls()?;

    println!("\n✓ All examples completed successfully!");
    Ok(())
}

fn example_plain() -> Result<()> {
    let addr = resolve_v4("localhost").context("Failed to resolve localhost")?;
    let target = AddressTarget::V4(addr);
    println!("localhost resolved to {target}");

    let client = TransportClient::installed(None)?;
    let mut conn = client
        .open(addr, 9000, false)
        .context("Failed to connect, is the echo example running?")?;

    conn.write_all(b"hello")?;
    let mut reply = [0u8; 5];
    conn.read_exact(&mut reply)?;
    println!("Echoed: {}", String::from_utf8_lossy(&reply));

    println!("Reliable path: {}", is_reliable(target));
    conn.close()?;
    println!("Max message size: {}", max_message_size(target));
    Ok(())
}

fn example_tls() -> Result<()> {
    let cert_path = ClientCertPath::new();
    if !cert_path.ca_path.exists() {
        println!("CA bundle not found at {:?}, skipping", cert_path.ca_path);
        return Ok(());
    }

    let tls = ClientTlsContext::load(&cert_path)?.with_server_name("localhost")?;
    let client = TransportClient::installed(Some(tls))?;
    let mut conn = client
        .open_host("localhost", 9000, true)
        .context("TLS connection failed, was the echo example started with --tls?")?;

    let mut index = 1;
    while let Some(tree) = conn.certificate_tree(index)? {
        let subject = tree
            .find(&["subject"])
            .and_then(|node| node.data.clone())
            .unwrap_or_default();
        println!("Certificate {index}: {subject}");
        index += 1;
    }

    conn.write_all(b"secure hello")?;
    let mut reply = [0u8; 12];
    conn.read_exact(&mut reply)?;
    println!("Echoed: {}", String::from_utf8_lossy(&reply));

    conn.close()?;
    Ok(())
}
