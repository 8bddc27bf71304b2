//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Client-certificate trust gate and reverse proxy
#[derive(Parser, Debug)]
#[command(name = "certgate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "CERTGATE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway server (default)
    Serve,

    /// Check a client certificate against a CA without starting the server
    CheckCert {
        /// CA certificate file (PEM, base64 PEM or base64 DER)
        #[arg(long, required = true)]
        ca: PathBuf,

        /// Client certificate file, or `-` for stdin (PEM or bare base64)
        #[arg(default_value = "-")]
        cert: String,
    },
}
