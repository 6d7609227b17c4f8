//! Bounded ring buffer of console broadcasts replayed to late-joining clients.
//!
//! [`EventLog`] stores raw upstream messages verbatim. Retention is governed by
//! [`Retention`]: a line cap, a byte cap, and an idle gap after which the
//! buffer starts over. The relay wraps it in a `Mutex` and clears it whenever
//! a new plugin connection is established.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::LogBufferConfig;

/// Eviction thresholds applied on every append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    pub max_lines: usize,
    pub max_bytes: usize,
    pub idle_reset: Duration,
}

impl From<&LogBufferConfig> for Retention {
    fn from(config: &LogBufferConfig) -> Self {
        Self {
            max_lines: config.max_lines,
            max_bytes: config.max_bytes,
            idle_reset: Duration::from_secs(config.idle_reset_secs),
        }
    }
}

/// Append-only buffer of broadcast messages.
pub struct EventLog {
    entries: VecDeque<String>,
    total_bytes: usize,
    last_append: Option<Instant>,
    retention: Retention,
}

impl EventLog {
    pub fn new(retention: Retention) -> Self {
        Self {
            entries: VecDeque::with_capacity(retention.max_lines.min(256)),
            total_bytes: 0,
            last_append: None,
            retention,
        }
    }

    /// Append a message, evicting per [`Retention`].
    pub fn append(&mut self, message: String) {
        self.append_at(message, Instant::now());
    }

    /// Append with an explicit clock reading.
    ///
    /// Order matters: idle reset first, then the line cap makes room for the
    /// new entry, then the byte cap trims from the front until it fits.
    pub fn append_at(&mut self, message: String, now: Instant) {
        if let Some(last) = self.last_append {
            if now.saturating_duration_since(last) > self.retention.idle_reset {
                self.clear();
            }
        }
        self.last_append = Some(now);

        if self.retention.max_lines == 0 {
            return;
        }
        if self.entries.len() >= self.retention.max_lines {
            self.pop_oldest();
        }

        self.total_bytes += message.len();
        self.entries.push_back(message);

        while self.total_bytes > self.retention.max_bytes {
            if self.pop_oldest().is_none() {
                break;
            }
        }
    }

    /// Oldest-first copy of the retained messages.
    pub fn snapshot(&self) -> Vec<String> {
        self.entries.iter().cloned().collect()
    }

    /// Drop everything. The idle clock is left untouched.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.total_bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of the byte lengths of the retained messages.
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    fn pop_oldest(&mut self) -> Option<String> {
        let entry = self.entries.pop_front()?;
        self.total_bytes -= entry.len();
        Some(entry)
    }
}
