//! Certgate - client-certificate trust gate and reverse proxy

use std::io::Read;
use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use certgate::{
    cert::{CaCertificate, ChainValidator, ClientCertificate, WebPkiChainValidator},
    cli::{Cli, Command},
    config::Config,
    gateway::Gateway,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env is normal outside local development
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::CheckCert { ref ca, ref cert }) => run_check_cert(ca, cert),
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

/// Verify one certificate against a CA and print the verdict
fn run_check_cert(ca_path: &Path, cert_source: &str) -> ExitCode {
    let ca = match std::fs::read_to_string(ca_path)
        .map_err(|e| e.to_string())
        .and_then(|value| CaCertificate::from_config_value(&value).map_err(|e| e.to_string()))
    {
        Ok(ca) => ca,
        Err(e) => {
            eprintln!("Failed to load CA {}: {e}", ca_path.display());
            return ExitCode::FAILURE;
        }
    };

    let raw = if cert_source == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf).map(|_| buf)
    } else {
        std::fs::read_to_string(cert_source)
    };
    let raw = match raw {
        Ok(raw) => raw,
        Err(e) => {
            eprintln!("Failed to read certificate from {cert_source}: {e}");
            return ExitCode::FAILURE;
        }
    };

    let client = match ClientCertificate::from_header_value(&raw) {
        Ok(client) => client,
        Err(e) => {
            println!("✗ Could not decode certificate: {e}");
            return ExitCode::FAILURE;
        }
    };

    println!("CA:      {}", ca.subject());
    println!("Subject: {}", client.subject());

    match WebPkiChainValidator::new().verify(&ca, &client) {
        Ok(true) => {
            println!("✓ Trusted");
            ExitCode::SUCCESS
        }
        Ok(false) => {
            println!("✗ Not issued by this CA, or outside its validity window");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("✗ Verification failed: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Run the gateway server
async fn run_server(cli: Cli) -> ExitCode {
    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            // Apply CLI overrides
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        targets = config.forwarding.targets.len(),
        verification = config.gate.enabled,
        "Starting certgate"
    );

    let gateway = match Gateway::new(config) {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
