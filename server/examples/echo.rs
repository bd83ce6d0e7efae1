use std::{
    io::{Read, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::{Context, Result};
use conduit_common::{config::ServerCertPath, Connection};
use conduit_server::{ServerTlsContext, TransportServer};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_PORT: u16 = 9000;

/// Echo server: every byte a client sends is written straight back.
///
/// Usage: `cargo run --example echo -- [port] [--tls]`
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let secure = args.iter().any(|arg| arg == "--tls");
    let port = match args.iter().find(|arg| !arg.starts_with("--")) {
        Some(port) => port.parse().context("Invalid port")?,
        None => DEFAULT_PORT,
    };

    println!("=== Conduit Echo Server Example ===");

    let tls = if secure {
        let cert_path = ServerCertPath::new();
        if !cert_path.cert_path.exists() {
            warn!("Server certificate not found at {:?}", cert_path.cert_path);
            println!("Set CONDUIT_CERTS_DIR to a directory containing server/server.pem");
            return Ok(());
        }
        Some(ServerTlsContext::load(&cert_path).context("Failed to load server certificate")?)
    } else {
        None
    };

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal, stopping server...");
        r.store(false, Ordering::SeqCst);
    })
    .context("Failed to set signal handler")?;

    let server = TransportServer::installed(tls).context("Failed to install transport")?;
    println!("Listening on port {port} (TLS: {secure}), press Ctrl+C to stop");

    if let Err(e) = server.serve(port, secure, running, echo) {
        error!("Echo server error: {}", e);
    }

    let closed = server.transport().teardown()?;
    info!("Echo server stopped, {} stream(s) closed", closed);
    Ok(())
}

fn echo(mut conn: Connection) -> conduit_common::Result<()> {
    if let Some(text) = conn.certificate(1)? {
        info!("Client certificate:\n{}", text);
    }

    let mut buf = [0u8; 4096];
    let mut total = 0usize;
    loop {
        let n = conn.read(&mut buf)?;
        if n == 0 {
            break;
        }
        conn.write_all(&buf[..n])?;
        total += n;
    }

    info!("Client {} disconnected after {} bytes", conn.handle(), total);
    conn.close()
}
