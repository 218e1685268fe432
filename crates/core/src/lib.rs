/// Bounded, timestamped packet queue with eviction and the eligibility drain.
pub mod buffer;

/// Monotonic time sources: the tokio clock and a manually advanced one for tests.
pub mod clock;

/// Configuration for controllers and sessions, and the command line surface.
pub mod config;

/// Packet holding controller: ingestion, burst releases and cancellation.
pub mod controller;

pub mod errors;

/// Handle over the tokio runtime background work is spawned on.
pub mod executor;

/// Foreground host used by the `holdback` binary.
pub mod host;

/// Session host feeding a controller from a packet source.
pub mod session;

/// Destinations for released batches.
pub mod sink;

/// Cancellable countdown timer.
pub mod timer;

/// Tracing and logging infrastructure.
#[cfg_attr(test, allow(dead_code))]
pub mod tracing;

pub use config::{HoldConfig, ReleaseMode, SessionConfig};
pub use controller::{ControllerStats, PacketController};
pub use session::HoldSession;
pub use sink::PacketSink;
pub use timer::DeadlineTimer;
