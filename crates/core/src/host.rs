//! Foreground host used by the `holdback` binary.
//!
//! [`run`] drives one session until either the source closes or `shutdown` resolves. On close
//! the youngest packets get a full hold before a final release; on shutdown whatever is still
//! held is discarded.

use std::future::Future;
use std::time::Duration;

use tokio::runtime::Runtime;

use crate::config::Config;
use crate::controller::{ControllerStats, PacketController};
use crate::session::{HoldSession, PacketSource};
use crate::sink::PacketSink;

/// How long runtime shutdown waits for blocking work, such as a pending stdin read, before
/// leaving it behind.
pub const SHUTDOWN_GRACE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostReport {
    /// Counters read after the session stopped.
    pub stats: ControllerStats,
    /// Whether `shutdown` ended the run rather than the source closing.
    pub interrupted: bool,
}

pub async fn run<P, S>(
    config: &Config,
    source: P,
    sink: S,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<HostReport>
where
    P: PacketSource,
    S: PacketSink,
{
    let controller = PacketController::new(config.hold.clone(), sink);
    let session = HoldSession::new(controller, config.session.clone());
    session.start(source)?;
    tracing::info!(
        hold = ?config.hold.hold_duration,
        capacity = config.hold.capacity,
        mode = ?config.session.release_mode,
        "holding packets"
    );

    let interrupted = tokio::select! {
        _ = shutdown => {
            tracing::info!("interrupted, discarding held packets");
            true
        }
        _ = session.wait_ingestion_end() => {
            // give the youngest packets their full hold before the final release
            tokio::time::sleep(config.hold.hold_duration).await;
            session
                .controller()
                .release(config.session.release_mode)
                .await;
            false
        }
    };

    session.stop().await?;
    let stats = session.controller().stats().await;
    tracing::info!(
        enqueued = stats.enqueued,
        released = stats.released,
        evicted = stats.evicted,
        discarded = stats.discarded_on_stop,
        "session finished"
    );
    Ok(HostReport { stats, interrupted })
}

/// Runs `future` to completion on `rt`, then shuts the runtime down without waiting more than
/// [`SHUTDOWN_GRACE`] for blocking tasks that cannot be cancelled.
pub fn block_on<F: Future>(rt: Runtime, future: F) -> F::Output {
    let output = rt.block_on(future);
    rt.shutdown_timeout(SHUTDOWN_GRACE);
    output
}
