use anyhow::Context;
use clap::Parser;
use holdback::{config::ConfigArgs, host, session::ReaderSource, sink::TracingSink};

async fn interrupted() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(%error, "failed listening for ctrl-c, waiting for stdin to close");
        futures::future::pending::<()>().await;
    }
}

fn main() -> anyhow::Result<()> {
    let config = ConfigArgs::parse().build()?;
    holdback::config::set_logger(config.log_level);
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .thread_name("holdback-worker")
        .build()
        .context("building tokio runtime")?;
    // stdin reads sit on the blocking pool, so the runtime is shut down with a grace period
    // rather than dropped
    host::block_on(rt, async {
        host::run(
            &config,
            ReaderSource::new(tokio::io::stdin()),
            TracingSink,
            interrupted(),
        )
        .await
    })?;
    Ok(())
}
