//! Centralized logging configuration for the DOS extender core.
//!
//! Every component logs through a single [`log`] entry point tagged with a
//! [`LogCategory`] and a [`LogLevel`]. Levels are configured per category with
//! a global fallback, so a host can, for example, trace every INT 31h call
//! while keeping XMS traffic quiet.
//!
//! # Architecture
//!
//! - **LogConfig**: Thread-safe global configuration using atomic operations
//! - **LogLevel**: Hierarchical log levels (Off < Error < Warn < Info < Debug < Trace)
//! - **LogCategory**: Components that log (Dpmi, ModeSwitch, Callbacks, Memory, Xms, Stubs)
//! - **log()**: Common logging function with lazy message construction
//!
//! # Performance
//!
//! - Messages are only formatted when the category/level pair is enabled
//! - File output goes through a background writer thread
//! - A per-category sliding window limits flooding from tight guest loops
//!
//! # Usage
//!
//! ```rust
//! use emu_core::logging::{log, LogCategory, LogLevel};
//!
//! log(LogCategory::Dpmi, LogLevel::Debug, || {
//!     format!("INT 31h AX={:04X}", 0x0501)
//! });
//! ```

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

/// Number of log categories
const CATEGORY_COUNT: usize = 6;

/// Default rate limit (messages per second per category)
const DEFAULT_RATE_LIMIT: usize = 60;

/// Log level for controlling verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    /// Parse log level from string (case-insensitive)
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "off" | "0" => Some(LogLevel::Off),
            "error" | "err" | "1" => Some(LogLevel::Error),
            "warn" | "warning" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    fn from_u8(val: u8) -> Self {
        match val {
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            5 => LogLevel::Trace,
            _ => LogLevel::Off,
        }
    }
}

/// Log category for the extender components
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogCategory {
    /// INT 31h service dispatch
    Dpmi,
    /// Real/protected mode transitions and real-mode calls
    ModeSwitch,
    /// Real-mode callback trampolines
    Callbacks,
    /// Linear and conventional memory allocation
    Memory,
    /// XMS driver entry point
    Xms,
    /// Acknowledged-but-unimplemented functions and unsupported calls
    Stubs,
}

impl LogCategory {
    /// All categories, in index order
    pub const ALL: [LogCategory; CATEGORY_COUNT] = [
        LogCategory::Dpmi,
        LogCategory::ModeSwitch,
        LogCategory::Callbacks,
        LogCategory::Memory,
        LogCategory::Xms,
        LogCategory::Stubs,
    ];

    fn index(self) -> usize {
        match self {
            LogCategory::Dpmi => 0,
            LogCategory::ModeSwitch => 1,
            LogCategory::Callbacks => 2,
            LogCategory::Memory => 3,
            LogCategory::Xms => 4,
            LogCategory::Stubs => 5,
        }
    }

    /// Parse a category name (case-insensitive)
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "dpmi" => Some(LogCategory::Dpmi),
            "modeswitch" | "mode-switch" | "mode" => Some(LogCategory::ModeSwitch),
            "callbacks" | "rmcb" => Some(LogCategory::Callbacks),
            "memory" | "mem" => Some(LogCategory::Memory),
            "xms" => Some(LogCategory::Xms),
            "stubs" => Some(LogCategory::Stubs),
            _ => None,
        }
    }
}

/// Per-category window state for the rate limiter
#[derive(Default)]
struct Window {
    /// Timestamps of messages accepted in the current window
    accepted: VecDeque<Instant>,
    /// Messages dropped since the last report
    dropped: usize,
    /// When drops were last reported
    last_report: Option<Instant>,
}

/// Sliding-window rate limiter, one window per category
struct RateLimiter {
    max_per_second: AtomicUsize,
    window: Duration,
    windows: Mutex<[Window; CATEGORY_COUNT]>,
}

impl RateLimiter {
    fn new(max_per_second: usize) -> Self {
        Self {
            max_per_second: AtomicUsize::new(max_per_second),
            window: Duration::from_secs(1),
            windows: Mutex::new(Default::default()),
        }
    }

    /// Returns (allowed, dropped_count_to_report)
    fn admit(&self, category: LogCategory) -> (bool, Option<usize>) {
        let now = Instant::now();
        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let w = &mut windows[category.index()];

        while let Some(&front) = w.accepted.front() {
            if now.duration_since(front) > self.window {
                w.accepted.pop_front();
            } else {
                break;
            }
        }

        if w.accepted.len() < self.max_per_second.load(Ordering::Relaxed) {
            w.accepted.push_back(now);
            if w.dropped > 0 {
                let dropped = std::mem::take(&mut w.dropped);
                w.last_report = Some(now);
                return (true, Some(dropped));
            }
            return (true, None);
        }

        w.dropped += 1;
        let report_due = w
            .last_report
            .map_or(true, |last| now.duration_since(last) >= self.window);
        if report_due {
            w.last_report = Some(now);
            (false, Some(std::mem::take(&mut w.dropped)))
        } else {
            (false, None)
        }
    }
}

/// Global logging configuration
pub struct LogConfig {
    /// Fallback level for categories without their own level
    global_level: AtomicU8,
    /// Per-category levels (Off means "use the global level")
    levels: [AtomicU8; CATEGORY_COUNT],
    /// Channel to the background file writer
    sink: Mutex<Option<Sender<String>>>,
    file_logging: AtomicBool,
    limiter: RateLimiter,
}

impl LogConfig {
    fn new() -> Self {
        Self {
            global_level: AtomicU8::new(LogLevel::Off as u8),
            levels: Default::default(),
            sink: Mutex::new(None),
            file_logging: AtomicBool::new(false),
            limiter: RateLimiter::new(DEFAULT_RATE_LIMIT),
        }
    }

    /// Get the global singleton instance
    pub fn global() -> &'static Self {
        static INSTANCE: OnceLock<LogConfig> = OnceLock::new();
        INSTANCE.get_or_init(LogConfig::new)
    }

    /// Set the fallback level
    pub fn set_global_level(&self, level: LogLevel) {
        self.global_level.store(level as u8, Ordering::Relaxed);
    }

    pub fn get_global_level(&self) -> LogLevel {
        LogLevel::from_u8(self.global_level.load(Ordering::Relaxed))
    }

    /// Set log level for a specific category
    pub fn set_level(&self, category: LogCategory, level: LogLevel) {
        self.levels[category.index()].store(level as u8, Ordering::Relaxed);
    }

    pub fn get_level(&self, category: LogCategory) -> LogLevel {
        LogLevel::from_u8(self.levels[category.index()].load(Ordering::Relaxed))
    }

    /// Check if a message should be logged for the given category and level
    ///
    /// A category with its own level uses it; otherwise the global level applies.
    pub fn should_log(&self, category: LogCategory, level: LogLevel) -> bool {
        if level == LogLevel::Off {
            return false;
        }
        let category_level = self.get_level(category);
        if category_level != LogLevel::Off {
            level <= category_level
        } else {
            level <= self.get_global_level()
        }
    }

    /// Reset all logging to Off
    pub fn reset(&self) {
        self.set_global_level(LogLevel::Off);
        for category in LogCategory::ALL {
            self.set_level(category, LogLevel::Off);
        }
    }

    /// Set the maximum messages per second per category
    pub fn set_rate_limit(&self, max_per_second: usize) {
        self.limiter
            .max_per_second
            .store(max_per_second, Ordering::Relaxed);
    }

    pub fn get_rate_limit(&self) -> usize {
        self.limiter.max_per_second.load(Ordering::Relaxed)
    }

    /// Route output to a file through a background writer thread
    pub fn set_log_file(&self, path: PathBuf) -> std::io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let (sender, receiver) = channel::<String>();

        thread::Builder::new()
            .name("log-writer".to_string())
            .spawn(move || {
                while let Ok(message) = receiver.recv() {
                    let _ = writeln!(file, "{}", message);
                    let _ = file.flush();
                }
            })?;

        let mut sink = match self.sink.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *sink = Some(sender);
        self.file_logging.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Stop logging to file; output returns to stderr
    pub fn clear_log_file(&self) {
        let mut sink = match self.sink.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *sink = None;
        self.file_logging.store(false, Ordering::Relaxed);
    }

    fn write_message(&self, message: String) {
        if self.file_logging.load(Ordering::Relaxed) {
            let sink = match self.sink.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(sender) = sink.as_ref() {
                if let Err(returned) = sender.send(message) {
                    eprintln!("{}", returned.0);
                }
                return;
            }
        }
        eprintln!("{}", message);
    }
}

/// Log a message with the specified category and level
///
/// The closure only runs when the category/level pair is enabled and the
/// category is within its rate limit. Dropped messages are summarised once
/// per second.
pub fn log<F>(category: LogCategory, level: LogLevel, message_fn: F)
where
    F: FnOnce() -> String,
{
    let config = LogConfig::global();
    if !config.should_log(category, level) {
        return;
    }

    let (allowed, dropped) = config.limiter.admit(category);
    if let Some(count) = dropped.filter(|&n| n > 0) {
        config.write_message(format!(
            "[{:?}] WARNING: Rate limit exceeded, {} log message(s) dropped in the last second",
            category, count
        ));
    }

    if allowed {
        config.write_message(format!("[{:?}] {}", category, message_fn()));
    }
}
