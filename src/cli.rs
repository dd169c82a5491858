//! Clap option structs for the client and server binaries

use clap::Parser;
use std::path::PathBuf;

pub const MIN_THREADS: usize = 1;
pub const MAX_THREADS: usize = 16;

/// Backup client options
#[derive(Clone, Debug, Parser)]
#[command(name = "mirra", about = "Continuously mirror a directory to a backup server")]
pub struct ClientOpts {
    /// Directory to watch
    #[arg(long = "path-to-watch", short = 'P', default_value = ".")]
    pub path_to_watch: PathBuf,

    /// Backup server hostname
    #[arg(long, short = 'H')]
    pub hostname: String,

    /// Backup server service name or port number
    #[arg(long, short = 'S')]
    pub service: String,

    /// Worker thread pool size (1-16)
    #[arg(long, short = 'T', default_value_t = 4)]
    pub threads: usize,

    /// Watcher refresh rate in milliseconds
    #[arg(long, short = 'D', default_value_t = 5000)]
    pub delay: u64,

    /// CA bundle used to verify the server certificate
    #[arg(long, default_value = "certs/ca.pem")]
    pub ca: PathBuf,

    /// Client certificate presented to the server (PEM)
    #[arg(long, default_value = "certs/client-cert.pem")]
    pub tls_cert: PathBuf,

    /// Client private key (PEM)
    #[arg(long, default_value = "certs/client-key.pem")]
    pub tls_key: PathBuf,

    /// Download the server tree into the watched directory, then exit
    #[arg(long)]
    pub restore: bool,
}

/// Backup server options
#[derive(Clone, Debug, Parser)]
#[command(name = "mirrad", about = "Backup server daemon")]
pub struct ServerOpts {
    /// Bind address
    #[arg(long, short = 'A')]
    pub address: String,

    /// Service name or port number to listen on
    #[arg(long, short = 'S')]
    pub service: String,

    /// Root directory holding one backup tree per user
    #[arg(long, default_value = "backup")]
    pub backup_root: PathBuf,

    /// Credentials file (`<username>\t<sha512-hex>` per line)
    #[arg(long, default_value = "credentials")]
    pub credentials_file: PathBuf,

    /// Request log file
    #[arg(long, default_value = "mirrad.log")]
    pub logger_file: PathBuf,

    /// Worker thread pool size (1-16)
    #[arg(long, short = 'T', default_value_t = 8)]
    pub threads: usize,

    /// Server certificate chain (PEM)
    #[arg(long, default_value = "certs/server-cert.pem")]
    pub tls_cert: PathBuf,

    /// Server private key (PEM)
    #[arg(long, default_value = "certs/server-key.pem")]
    pub tls_key: PathBuf,

    /// CA bundle used to verify client certificates
    #[arg(long, default_value = "certs/ca.pem")]
    pub client_ca: PathBuf,
}

/// Clamp a requested worker-pool size into the supported range, reporting
/// when the value had to change.
pub fn clamp_threads(requested: usize) -> usize {
    let clamped = requested.clamp(MIN_THREADS, MAX_THREADS);
    if clamped != requested {
        println!("--threads option clamped to {}", clamped);
    }
    clamped
}
