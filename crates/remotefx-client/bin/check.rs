//! Connectivity check
//!
//! Connects to a remote host, negotiates a stereo session and prints the
//! server load and the recently used plugins.

use remotefx_client::{ClientConfig, Endpoint, Result, Session};
use std::env;

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let mut args = env::args().skip(1);
    let Some(host) = args.next() else {
        eprintln!("usage: remotefx-check <host> [port]");
        std::process::exit(2);
    };
    let config = ClientConfig::default();
    let port = match args.next() {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            eprintln!("invalid port: {}", raw);
            std::process::exit(2);
        }),
        None => config.server_port,
    };

    let session = Session::new(config)?;
    session.set_server(Endpoint::new(host, port));
    session.init(2, 2, 48000.0, 512, false)?;

    tracing::info!(
        "connected to {}, latency {} samples",
        session.server_host_and_id(),
        session.latency_samples()
    );
    println!("load: {:.2}", session.update_load()?);
    for plugin in session.recents()? {
        println!("{}\t{}\t{}", plugin.plugin_type, plugin.name, plugin.id);
    }

    session.close();
    Ok(())
}
