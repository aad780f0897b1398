use ahash::AHashMap;
use anyhow::Context;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;

/// Logging setup for the driver binary. Library code only emits `tracing`
/// events and never installs a subscriber itself.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct LoggerConfig {
    /// Level or full filter directive, e.g. `info` or `tidewatch::station=debug`.
    pub level: String,
    pub file_dir: Option<String>,
    pub file_prefix: Option<String>,
    pub rolling: Option<String>,
    #[serde(default = "default_max_files")]
    pub max_files: usize,
}

fn default_max_files() -> usize {
    7
}

impl LoggerConfig {
    /// Reads LOG_LEVEL, LOG_FILE_DIR, LOG_FILE_PREFIX and LOG_ROLLING,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            level: std::env::var("LOG_LEVEL").unwrap_or(defaults.level),
            file_dir: std::env::var("LOG_FILE_DIR").ok(),
            file_prefix: std::env::var("LOG_FILE_PREFIX").ok(),
            rolling: std::env::var("LOG_ROLLING").ok().or(defaults.rolling),
            max_files: defaults.max_files,
        }
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_new(&self.level).unwrap_or_else(|_| EnvFilter::new("info"))
    }

    /// Installs the global subscriber. Keep the returned guard alive for as
    /// long as file logging should flush.
    pub fn init(&self) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
        if let Some(dir) = self.file_dir.as_deref() {
            let prefix = self.file_prefix.as_deref().unwrap_or("tidewatch");

            let rotation = match self.rolling.as_deref() {
                Some("hourly") => Rotation::HOURLY,
                Some("minutely") => Rotation::MINUTELY,
                Some("never") => Rotation::NEVER,
                _ => Rotation::DAILY,
            };

            let appender = RollingFileAppender::builder()
                .rotation(rotation)
                .max_log_files(self.max_files)
                .filename_prefix(prefix)
                .build(dir)
                .with_context(|| format!("failed to create rolling appender in {dir}"))?;

            let (writer, guard) = tracing_appender::non_blocking(appender);

            let _ = tracing_subscriber::fmt()
                .with_env_filter(self.filter())
                .with_writer(writer)
                .with_ansi(false)
                .try_init();

            tracing::info!("logging to dir: {}, prefix: {}", dir, prefix);
            Ok(Some(guard))
        } else {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(self.filter())
                .try_init();
            Ok(None)
        }
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_dir: None,
            file_prefix: None,
            rolling: Some("daily".to_string()),
            max_files: default_max_files(),
        }
    }
}

/// Rate limiter for a single log call site. Messages inside the interval are
/// counted and the count is attached to the next emitted message.
pub struct Throttle {
    last: Mutex<Option<Instant>>,
    suppressed: AtomicU64,
    interval: Duration,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            last: Mutex::new(None),
            suppressed: AtomicU64::new(0),
            interval,
        }
    }

    /// `Some(suppressed_count)` when the caller may log now.
    #[inline]
    pub fn poll(&self) -> Option<u64> {
        let mut last = self.last.lock();
        match *last {
            Some(at) if at.elapsed() < self.interval => {
                self.suppressed.fetch_add(1, Ordering::Relaxed);
                None
            }
            _ => {
                *last = Some(Instant::now());
                Some(self.suppressed.swap(0, Ordering::Relaxed))
            }
        }
    }
}

/// One [`Throttle`] per key behind a single call site, so a noisy component
/// cannot silence the same message from its siblings.
pub struct KeyedThrottle {
    slots: Mutex<AHashMap<String, Throttle>>,
    interval: Duration,
}

impl KeyedThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            slots: Mutex::new(AHashMap::new()),
            interval,
        }
    }

    pub fn poll(&self, key: &str) -> Option<u64> {
        let mut slots = self.slots.lock();
        if let Some(t) = slots.get(key) {
            return t.poll();
        }
        let t = Throttle::new(self.interval);
        let first = t.poll();
        slots.insert(key.to_string(), t);
        first
    }
}

/// Level-generic throttled log: `log_throttled!(warn, Duration::from_secs(5), "...")`.
#[macro_export]
macro_rules! log_throttled {
    ($level:ident, $interval:expr, $($arg:tt)*) => {{
        static _THROTTLE: std::sync::OnceLock<$crate::utils::logger::Throttle> = std::sync::OnceLock::new();
        let t = _THROTTLE.get_or_init(|| $crate::utils::logger::Throttle::new($interval));
        if let Some(_suppressed) = t.poll() {
            if _suppressed > 0 {
                tracing::$level!(suppressed = _suppressed, $($arg)*);
            } else {
                tracing::$level!($($arg)*);
            }
        }
    }};
}

/// Like [`log_throttled!`] with a separate window per key, typically the
/// component name: `log_throttled_by!(warn, name, Duration::from_secs(5), "...")`.
#[macro_export]
macro_rules! log_throttled_by {
    ($level:ident, $key:expr, $interval:expr, $($arg:tt)*) => {{
        static _THROTTLE: std::sync::OnceLock<$crate::utils::logger::KeyedThrottle> = std::sync::OnceLock::new();
        let t = _THROTTLE.get_or_init(|| $crate::utils::logger::KeyedThrottle::new($interval));
        if let Some(_suppressed) = t.poll(::core::convert::AsRef::<str>::as_ref(&$key)) {
            if _suppressed > 0 {
                tracing::$level!(suppressed = _suppressed, $($arg)*);
            } else {
                tracing::$level!($($arg)*);
            }
        }
    }};
}

#[macro_export]
macro_rules! warn_throttled  { ($interval:expr, $($arg:tt)*) => { $crate::log_throttled!(warn,  $interval, $($arg)*); } }
#[macro_export]
macro_rules! warn_throttled_by { ($key:expr, $interval:expr, $($arg:tt)*) => { $crate::log_throttled_by!(warn, $key, $interval, $($arg)*); } }
