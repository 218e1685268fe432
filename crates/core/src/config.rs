use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

use crate::errors::ConfigError;

/// Default minimum time a packet is held before it may be released.
pub const DEFAULT_HOLD_DURATION: Duration = Duration::from_millis(250);
/// Default maximum number of buffered packets.
pub const DEFAULT_CAPACITY: usize = 256;
/// Default pause between emissions of a sequential burst.
pub const DEFAULT_FAST_SEQUENTIAL_DELAY: Duration = Duration::from_millis(10);
/// Default upper bound for a single deadline timer wait.
///
/// Bounds how late a cancelled run can observe its cancellation and how late an expiry can be
/// noticed if the runtime oversleeps.
pub const DEFAULT_TICK_GRANULARITY: Duration = Duration::from_millis(250);
/// Largest payload read from a packet source in one go.
pub const DEFAULT_MTU: usize = 1500;
/// Pause between polls of a packet source that had nothing to offer.
pub const DEFAULT_IDLE_SLEEP: Duration = Duration::from_millis(50);

/// How a release hands drained packets to the sink.
#[derive(
    clap::ValueEnum, Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum ReleaseMode {
    /// One sink call carrying every eligible packet.
    #[default]
    Instant,
    /// One sink call per packet, paced by the fast sequential delay.
    Sequential,
}

/// Controller settings, fixed for the controller's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoldConfig {
    pub hold_duration: Duration,
    pub capacity: usize,
    pub fast_sequential_delay: Duration,
}

impl Default for HoldConfig {
    fn default() -> Self {
        Self {
            hold_duration: DEFAULT_HOLD_DURATION,
            capacity: DEFAULT_CAPACITY,
            fast_sequential_delay: DEFAULT_FAST_SEQUENTIAL_DELAY,
        }
    }
}

impl HoldConfig {
    pub fn new(hold_duration: Duration, capacity: usize, fast_sequential_delay: Duration) -> Self {
        Self {
            hold_duration,
            capacity,
            fast_sequential_delay,
        }
    }
}

/// Settings for the session host driving a controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub mtu: usize,
    pub idle_sleep: Duration,
    pub tick: Duration,
    /// Arm the deadline timer for this long when the session starts. `None` leaves releases
    /// entirely to the caller.
    pub release_after: Option<Duration>,
    pub release_mode: ReleaseMode,
    /// Re-arm the timer after every expiry.
    pub repeat: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            idle_sleep: DEFAULT_IDLE_SLEEP,
            tick: DEFAULT_TICK_GRANULARITY,
            release_after: None,
            release_mode: ReleaseMode::default(),
            repeat: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub hold: HoldConfig,
    pub session: SessionConfig,
    pub log_level: Option<LevelFilter>,
}

impl Config {
    /// Command line arguments that would reproduce this configuration.
    pub fn to_args(&self) -> ConfigArgs {
        ConfigArgs {
            hold_ms: Some(millis(self.hold.hold_duration)),
            capacity: Some(self.hold.capacity),
            fast_sequential_delay_ms: Some(millis(self.hold.fast_sequential_delay)),
            tick_ms: Some(millis(self.session.tick)),
            mtu: Some(self.session.mtu),
            idle_sleep_ms: Some(millis(self.session.idle_sleep)),
            release_after_ms: self.session.release_after.map(millis),
            release_mode: Some(self.session.release_mode),
            repeat: Some(self.session.repeat),
            log_level: self.log_level,
            config_file: None,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.session.mtu == 0 {
            return Err(ConfigError::Invalid {
                field: "mtu",
                reason: "must be greater than zero".into(),
            });
        }
        if self.session.tick.is_zero() {
            return Err(ConfigError::Invalid {
                field: "tick-ms",
                reason: "must be greater than zero".into(),
            });
        }
        if self.session.repeat && self.session.release_after.is_none() {
            return Err(ConfigError::Invalid {
                field: "repeat",
                reason: "requires release-after-ms".into(),
            });
        }
        Ok(())
    }
}

/// Whole milliseconds, saturating at `u64::MAX`.
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[derive(clap::Parser, Debug, Default, Clone, Serialize, Deserialize)]
#[command(name = "holdback", version, about)]
pub struct ConfigArgs {
    /// Minimum time in milliseconds a packet is held before it may be released.
    /// 0 disables holding. Default: 250
    #[arg(long, env = "HOLD_MS")]
    #[serde(rename = "hold-ms", skip_serializing_if = "Option::is_none")]
    pub hold_ms: Option<u64>,

    /// Maximum number of buffered packets; the oldest is dropped on overflow. Default: 256
    #[arg(long, env = "CAPACITY")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<usize>,

    /// Pause in milliseconds between packets of a sequential burst. Default: 10
    #[arg(long, env = "FAST_SEQUENTIAL_DELAY_MS")]
    #[serde(
        rename = "fast-sequential-delay-ms",
        skip_serializing_if = "Option::is_none"
    )]
    pub fast_sequential_delay_ms: Option<u64>,

    /// Longest single wait of the deadline timer, in milliseconds. Default: 250
    #[arg(long, env = "TICK_MS")]
    #[serde(rename = "tick-ms", skip_serializing_if = "Option::is_none")]
    pub tick_ms: Option<u64>,

    /// Largest packet read from the source. Default: 1500
    #[arg(long, env = "MTU")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtu: Option<usize>,

    /// Idle pause in milliseconds when the source has nothing to read. Default: 50
    #[arg(long, env = "IDLE_SLEEP_MS")]
    #[serde(rename = "idle-sleep-ms", skip_serializing_if = "Option::is_none")]
    pub idle_sleep_ms: Option<u64>,

    /// Release held packets this many milliseconds after the session starts.
    #[arg(long, env = "RELEASE_AFTER_MS")]
    #[serde(rename = "release-after-ms", skip_serializing_if = "Option::is_none")]
    pub release_after_ms: Option<u64>,

    /// Burst pattern used for timed releases. Default: instant
    #[arg(long, value_enum, env = "RELEASE_MODE")]
    #[serde(rename = "release-mode", skip_serializing_if = "Option::is_none")]
    pub release_mode: Option<ReleaseMode>,

    /// Re-arm the release timer after every expiry.
    #[arg(long, env = "REPEAT")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeat: Option<bool>,

    #[arg(long, env = "LOG_LEVEL")]
    #[serde(skip)]
    pub log_level: Option<LevelFilter>,

    /// TOML file with any of the options above. Command line and environment values win.
    #[arg(long, env = "CONFIG_FILE")]
    #[serde(skip)]
    pub config_file: Option<PathBuf>,
}

impl ConfigArgs {
    fn read_config(path: &Path) -> Result<ConfigArgs, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let file = toml::from_str::<ConfigArgs>(&content)?;
        tracing::debug!(path = %path.display(), "Found configuration file");
        Ok(file)
    }

    /// Fills every option not given on the command line from `file`.
    fn merge(&mut self, file: ConfigArgs) {
        self.hold_ms = self.hold_ms.or(file.hold_ms);
        self.capacity = self.capacity.or(file.capacity);
        self.fast_sequential_delay_ms = self
            .fast_sequential_delay_ms
            .or(file.fast_sequential_delay_ms);
        self.tick_ms = self.tick_ms.or(file.tick_ms);
        self.mtu = self.mtu.or(file.mtu);
        self.idle_sleep_ms = self.idle_sleep_ms.or(file.idle_sleep_ms);
        self.release_after_ms = self.release_after_ms.or(file.release_after_ms);
        self.release_mode = self.release_mode.or(file.release_mode);
        self.repeat = self.repeat.or(file.repeat);
    }

    pub fn build(mut self) -> anyhow::Result<Config> {
        if let Some(path) = self.config_file.take() {
            let file = Self::read_config(&path)
                .with_context(|| format!("loading configuration from {}", path.display()))?;
            self.merge(file);
        }

        let config = Config {
            hold: HoldConfig {
                hold_duration: self
                    .hold_ms
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_HOLD_DURATION),
                capacity: self.capacity.unwrap_or(DEFAULT_CAPACITY),
                fast_sequential_delay: self
                    .fast_sequential_delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_FAST_SEQUENTIAL_DELAY),
            },
            session: SessionConfig {
                mtu: self.mtu.unwrap_or(DEFAULT_MTU),
                idle_sleep: self
                    .idle_sleep_ms
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_IDLE_SLEEP),
                tick: self
                    .tick_ms
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_TICK_GRANULARITY),
                release_after: self.release_after_ms.map(Duration::from_millis),
                release_mode: self.release_mode.unwrap_or_default(),
                repeat: self.repeat.unwrap_or(false),
            },
            log_level: self.log_level,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Installs the global tracing subscriber. Only the first call has any effect.
pub fn set_logger(level: Option<LevelFilter>) {
    #[cfg(feature = "trace")]
    {
        use std::sync::atomic::AtomicBool;

        static LOGGER_SET: AtomicBool = AtomicBool::new(false);
        if LOGGER_SET
            .compare_exchange(
                false,
                true,
                std::sync::atomic::Ordering::Release,
                std::sync::atomic::Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }

        crate::tracing::tracer::init_tracer(level).expect("failed tracing initialization")
    }
    #[cfg(not(feature = "trace"))]
    let _ = level;
}
