use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;

use mirra::cli::{clamp_threads, ServerOpts};
use mirra::handler::RequestHandler;
use mirra::logger::Logger;
use mirra::server::{run_until_shutdown, Server};
use mirra::tls;

fn main() -> Result<()> {
    let opts = ServerOpts::parse();

    std::fs::create_dir_all(&opts.backup_root)
        .with_context(|| format!("create backup root {}", opts.backup_root.display()))?;
    if !opts.credentials_file.is_file() {
        anyhow::bail!("credentials file {} not found", opts.credentials_file.display());
    }

    let threads = clamp_threads(opts.threads);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(threads)
        .build()
        .context("build runtime")?;

    runtime.block_on(run(opts))
}

async fn run(opts: ServerOpts) -> Result<()> {
    let tls_config = tls::build_server_config(&opts.tls_cert, &opts.tls_key, &opts.client_ca)?;
    let logger = Arc::new(Logger::new(&opts.logger_file)?);
    let handler = Arc::new(RequestHandler::new(
        opts.backup_root.clone(),
        opts.credentials_file.clone(),
    ));

    let server = Server::bind(&opts.address, &opts.service, tls_config, handler, logger).await?;
    println!(
        "mirrad listening on {} (backup root {}, log {})",
        server.local_addr()?,
        opts.backup_root.display(),
        opts.logger_file.display()
    );
    run_until_shutdown(server).await
}
