//! Fetch a URL through a pinned client
//!
//! Usage: cargo run --example pinned_fetch -- <pins.json> <url>

use std::sync::Arc;

use certpin::{tls, PinningConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("certpin=debug")))
        .init();

    let mut args = std::env::args().skip(1);
    let (Some(config_path), Some(url)) = (args.next(), args.next()) else {
        eprintln!("usage: pinned_fetch <pins.json> <url>");
        std::process::exit(2);
    };

    let config = PinningConfig::load(&config_path)?;
    let validator = Arc::new(config.build_validator()?);
    for host in validator.registry().hosts() {
        for pin in validator.registry().lookup(host) {
            println!("pinned {} -> {}", host, pin.fingerprint());
        }
    }

    let client = tls::create_pinned_client(validator)?;
    match client.get(&url).send().await {
        Ok(resp) => println!("{} -> HTTP {}", url, resp.status()),
        Err(e) => println!("{} -> rejected: {:?}", url, e),
    }

    Ok(())
}
