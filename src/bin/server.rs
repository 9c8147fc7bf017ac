//! Phantom server binary.
//!
//! Usage: phantom-server [OPTIONS]
//!
//! Options:
//!   -c <FILE>   Path to configuration file (default: config.toml)
//!   -v          Print version and exit
//!   -gen-psk    Generate a fresh base64 PSK and exit

use std::env;
use std::process;

use tokio::sync::watch;

use phantom::crypto::generate_psk;
use phantom::server::Server;
use phantom::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();

    let mut config_path = "config.toml".to_string();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-v" | "--version" => {
                println!("Phantom Server v{}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "-gen-psk" | "--gen-psk" => {
                println!("{}", generate_psk());
                return Ok(());
            }
            "-c" | "--config" => {
                i += 1;
                match args.get(i) {
                    Some(path) => config_path = path.clone(),
                    None => {
                        eprintln!("error: -c requires a file path");
                        process::exit(1);
                    }
                }
            }
            "-h" | "--help" => {
                print_usage();
                return Ok(());
            }
            other => {
                eprintln!("unknown option: {other}");
                print_usage();
                process::exit(1);
            }
        }
        i += 1;
    }

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            process::exit(1);
        }
    };

    // RUST_LOG wins over the configured level.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone())),
        )
        .with_target(false)
        .init();

    tracing::info!(
        listen = %config.listen_addr(),
        time_window = config.time_window,
        "starting phantom server v{}",
        env!("CARGO_PKG_VERSION")
    );

    let server = Server::new(config)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut server_task = tokio::spawn(async move { server.run(shutdown_rx).await });

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("SIGTERM received, shutting down");
        }
        result = &mut server_task => {
            // Bind failure or another fatal startup error.
            result??;
            return Ok(());
        }
    }

    let _ = shutdown_tx.send(true);
    server_task.await??;
    Ok(())
}

fn print_usage() {
    println!(
        r#"Phantom Server - encrypted tunneling proxy

USAGE:
    phantom-server [OPTIONS]

OPTIONS:
    -c <FILE>     Path to configuration file (default: config.toml)
    -v            Print version and exit
    -gen-psk      Generate a fresh base64 PSK and exit
    -h, --help    Print this help

EXAMPLES:
    Generate a PSK for a new deployment:
        phantom-server -gen-psk

    Run with a configuration file:
        phantom-server -c /etc/phantom/config.toml
"#
    );
}
