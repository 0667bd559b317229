// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Leveled logging context shared by the components of one pipeline instance.
//!
//! Records go through the `log` facade. The context only decides which of them are emitted, so
//! two pipelines in the same process can run with different verbosity and are told apart by
//! their log target.

use std::str::FromStr;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use enumn::N;

/// Verbosity of a pipeline instance.
#[derive(N, Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogsLevel {
    /// Nothing is logged.
    #[default]
    None = 0,
    /// Indices of processed frames and lifecycle events.
    Low = 1,
    /// Also the duration of every processing step.
    Medium = 2,
    /// Also per-call details of every component.
    High = 3,
}

impl FromStr for LogsLevel {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" | "NONE" => Ok(LogsLevel::None),
            "low" | "LOW" => Ok(LogsLevel::Low),
            "medium" | "MEDIUM" => Ok(LogsLevel::Medium),
            "high" | "HIGH" => Ok(LogsLevel::High),
            _ => Err("unrecognized logs level. Valid values: none, low, medium, high"),
        }
    }
}

static NEXT_INSTANCE: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug)]
pub struct LogContext {
    level: AtomicU8,
    target: String,
}

impl LogContext {
    /// Creates a context with a target unique to this process, e.g. `framestream::3`.
    pub fn new(level: LogsLevel) -> Arc<Self> {
        let instance = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
        Self::with_target(format!("framestream::{}", instance), level)
    }

    pub fn with_target(target: String, level: LogsLevel) -> Arc<Self> {
        Arc::new(Self {
            level: AtomicU8::new(level as u8),
            target,
        })
    }

    pub fn set_level(&self, level: LogsLevel) {
        self.level.store(level as u8, Ordering::Relaxed);
    }

    pub fn level(&self) -> LogsLevel {
        LogsLevel::n(self.level.load(Ordering::Relaxed)).unwrap_or_default()
    }

    /// Whether records of `level` should be emitted.
    pub fn enabled(&self, level: LogsLevel) -> bool {
        level != LogsLevel::None && self.level() >= level
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Starts timing a step. Its duration is logged at [`LogsLevel::Medium`] when the returned
    /// guard is dropped.
    pub fn timed<'a>(&'a self, step: &'a str) -> TimedBlock<'a> {
        if self.enabled(LogsLevel::High) {
            log::trace!(target: self.target(), "start {}", step);
        }

        TimedBlock {
            ctx: self,
            step,
            start: Instant::now(),
        }
    }
}

impl Default for LogContext {
    fn default() -> Self {
        Self {
            level: AtomicU8::new(LogsLevel::None as u8),
            target: String::from("framestream"),
        }
    }
}

pub struct TimedBlock<'a> {
    ctx: &'a LogContext,
    step: &'a str,
    start: Instant,
}

impl Drop for TimedBlock<'_> {
    fn drop(&mut self) {
        if self.ctx.enabled(LogsLevel::Medium) {
            log::debug!(
                target: self.ctx.target(),
                "{} took {} us",
                self.step,
                self.start.elapsed().as_micros()
            );
        }
    }
}

/// Logs through `$ctx` (a [`LogContext`]) if its level allows it. `Warn` records are emitted at
/// any level but [`LogsLevel::None`].
macro_rules! log_at {
    ($ctx:expr, Warn, $($arg:tt)+) => {
        if $ctx.enabled($crate::logging::LogsLevel::Low) {
            log::warn!(target: $ctx.target(), $($arg)+)
        }
    };
    ($ctx:expr, Low, $($arg:tt)+) => {
        if $ctx.enabled($crate::logging::LogsLevel::Low) {
            log::info!(target: $ctx.target(), $($arg)+)
        }
    };
    ($ctx:expr, Medium, $($arg:tt)+) => {
        if $ctx.enabled($crate::logging::LogsLevel::Medium) {
            log::debug!(target: $ctx.target(), $($arg)+)
        }
    };
    ($ctx:expr, High, $($arg:tt)+) => {
        if $ctx.enabled($crate::logging::LogsLevel::High) {
            log::trace!(target: $ctx.target(), $($arg)+)
        }
    };
}

pub(crate) use log_at;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_gates_records() {
        let ctx = LogContext::new(LogsLevel::Medium);
        assert!(ctx.enabled(LogsLevel::Low));
        assert!(ctx.enabled(LogsLevel::Medium));
        assert!(!ctx.enabled(LogsLevel::High));
        assert!(!ctx.enabled(LogsLevel::None));

        ctx.set_level(LogsLevel::None);
        assert!(!ctx.enabled(LogsLevel::Low));
    }

    #[test]
    fn instances_get_distinct_targets() {
        let a = LogContext::new(LogsLevel::Low);
        let b = LogContext::new(LogsLevel::Low);
        assert_ne!(a.target(), b.target());
    }

    #[test]
    fn parse_level() {
        assert_eq!("medium".parse::<LogsLevel>().unwrap(), LogsLevel::Medium);
        assert!("loud".parse::<LogsLevel>().is_err());
    }
}
