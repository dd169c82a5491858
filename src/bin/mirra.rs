use anyhow::{bail, Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

use mirra::cli::{clamp_threads, ClientOpts};
use mirra::connection::Connection;
use mirra::dir_view::DirView;
use mirra::scheduler::Scheduler;
use mirra::tls;
use mirra::watcher::FileWatcher;

fn main() -> Result<()> {
    let opts = ClientOpts::parse();

    let path_to_watch = opts
        .path_to_watch
        .canonicalize()
        .with_context(|| format!("{} does not exist", opts.path_to_watch.display()))?;
    if !path_to_watch.is_dir() {
        bail!("{} is not a directory", path_to_watch.display());
    }
    println!("watching {} (refresh every {} ms)", path_to_watch.display(), opts.delay);

    let threads = clamp_threads(opts.threads);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(threads)
        .build()
        .context("build runtime")?;

    runtime.block_on(run(opts, path_to_watch))
}

async fn run(opts: ClientOpts, path_to_watch: std::path::PathBuf) -> Result<()> {
    let config = tls::build_client_config(&opts.ca, &opts.tls_cert, &opts.tls_key)?;
    let mut conn = Connection::new(config, &opts.hostname);
    conn.resolve(&opts.hostname, &opts.service)?;
    conn.connect().await?;

    let dir = Arc::new(DirView::new(path_to_watch));
    let scheduler = Scheduler::new(dir.clone(), conn);

    if !scheduler.login().await? {
        bail!("authentication failed");
    }

    if opts.restore {
        scheduler.restore().await?;
        return Ok(());
    }

    scheduler.spawn_keepalive();
    let watcher = FileWatcher::new(dir, scheduler, Duration::from_millis(opts.delay))?;
    watcher.start().await
}
