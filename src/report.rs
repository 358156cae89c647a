//! Operator-facing message channel.
//!
//! `report_channel` returns a connected [`ReportSender`] / [`ReportReceiver`]
//! pair. The runner emits status, warnings and errors through the sender; the
//! operator surface drains the receiver in FIFO order.
//!
//! ## Back-pressure
//!
//! The queue holds at most `capacity` messages. When it is full:
//!
//! 1. the oldest DEVELOPER message is dropped; otherwise
//! 2. a new DEVELOPER message is dropped; otherwise
//! 3. the oldest INFO or WARNING message is dropped; otherwise
//! 4. ERROR and CRITICAL messages are queued beyond the bound.
//!
//! ERROR and CRITICAL messages are never dropped.
//!
//! ## Anti-flood
//!
//! Every message carries a [`DelayClass`]. A repeat of the same severity and
//! text that arrives within the window of its previous sighting is
//! suppressed and counted. Suppressed repeats refresh the last-seen time, so
//! a fault that keeps flapping stays quiet until it has been absent for a
//! full window. The next announcement carries the count in
//! [`Message::repeats`].
//!
//! Every emitted message is mirrored to `tracing`.

use crate::config::ReportConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Suppression entries kept before stale ones are pruned.
const MAX_TRACKED_TEXTS: usize = 512;

/// Message severity, lowest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Diagnostics for developers.
    Developer,
    /// Progress the operator may want to see.
    Info,
    /// Something degraded but the run goes on.
    Warning,
    /// A point or cycle was lost.
    Error,
    /// The run cannot continue.
    Critical,
}

impl Severity {
    /// ERROR and CRITICAL messages survive back-pressure.
    pub fn is_droppable(self) -> bool {
        self < Self::Error
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Developer => "DEVELOPER",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        };
        f.write_str(label)
    }
}

/// How soon an identical message may be announced again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayClass {
    /// Never suppressed.
    Immediate,
    /// Repeats are suppressed until the text has been absent for a fixed window.
    Fixed(#[serde(with = "humantime_serde")] Duration),
    /// The window widens along the configured escalation steps with every
    /// suppressed repeat and falls back to the first step once announced again.
    Escalating,
}

/// One announced operator message.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Message {
    /// How serious the message is.
    pub severity: Severity,
    /// Message text; also the suppression key.
    pub text: String,
    /// When it was announced.
    pub timestamp: DateTime<Utc>,
    /// Anti-flood class it was admitted under.
    pub delay: DelayClass,
    /// Identical messages suppressed since the previous announcement.
    pub repeats: u32,
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.severity,
            self.text
        )?;
        if self.repeats > 0 {
            write!(f, " (repeated {} times)", self.repeats)?;
        }
        Ok(())
    }
}

struct Suppression {
    last_seen: Instant,
    window: Duration,
    step: usize,
    repeats: u32,
}

#[derive(Default)]
struct Queue {
    messages: VecDeque<Message>,
    dropped: u64,
}

struct Shared {
    config: ReportConfig,
    queue: Mutex<Queue>,
    suppression: Mutex<HashMap<(Severity, String), Suppression>>,
    senders: AtomicUsize,
    notify: Notify,
}

impl Shared {
    fn queue(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn default_delay(&self, severity: Severity) -> DelayClass {
        match severity {
            Severity::Developer => self.config.developer,
            Severity::Info => self.config.info,
            Severity::Warning => self.config.warning,
            Severity::Error => self.config.error,
            Severity::Critical => self.config.critical,
        }
    }

    fn escalation_step(&self, step: usize) -> (usize, Duration) {
        let last = self.config.escalation.len().saturating_sub(1);
        let step = step.min(last);
        let window = self
            .config
            .escalation
            .get(step)
            .copied()
            .unwrap_or(Duration::ZERO);
        (step, window)
    }

    /// Returns `Some(repeats)` when the message should be announced.
    fn admit(&self, severity: Severity, text: &str, delay: DelayClass) -> Option<u32> {
        let base = match delay {
            DelayClass::Immediate => return Some(0),
            DelayClass::Fixed(window) => window,
            DelayClass::Escalating => self.escalation_step(0).1,
        };
        let now = Instant::now();
        let mut table = self
            .suppression
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let key = (severity, text.to_string());
        if let Some(entry) = table.get_mut(&key) {
            // The window runs from the latest sighting, announced or not.
            let quiet = now.duration_since(entry.last_seen);
            entry.last_seen = now;
            if quiet < entry.window {
                entry.repeats += 1;
                if delay == DelayClass::Escalating {
                    let (step, window) = self.escalation_step(entry.step + 1);
                    entry.step = step;
                    entry.window = window;
                }
                return None;
            }
            let repeats = std::mem::take(&mut entry.repeats);
            entry.window = base;
            entry.step = 0;
            return Some(repeats);
        }

        if table.len() >= MAX_TRACKED_TEXTS {
            table.retain(|_, s| now.duration_since(s.last_seen) < s.window);
        }
        table.insert(
            key,
            Suppression {
                last_seen: now,
                window: base,
                step: 0,
                repeats: 0,
            },
        );
        Some(0)
    }

    fn push(&self, message: Message) {
        let mut queue = self.queue();
        if queue.messages.len() >= self.config.capacity && !make_room(&mut queue, message.severity) {
            return;
        }
        queue.messages.push_back(message);
        drop(queue);
        self.notify.notify_one();
    }
}

/// Frees a slot for a message of `incoming` severity. Returns false when the
/// incoming message itself is the one to drop.
fn make_room(queue: &mut Queue, incoming: Severity) -> bool {
    if let Some(index) = oldest(queue, |s| s == Severity::Developer) {
        queue.messages.remove(index);
        queue.dropped += 1;
        return true;
    }
    if incoming == Severity::Developer {
        queue.dropped += 1;
        return false;
    }
    if let Some(index) = oldest(queue, Severity::is_droppable) {
        queue.messages.remove(index);
        queue.dropped += 1;
        return true;
    }
    if incoming.is_droppable() {
        queue.dropped += 1;
        return false;
    }
    true
}

fn oldest(queue: &Queue, wanted: impl Fn(Severity) -> bool) -> Option<usize> {
    queue.messages.iter().position(|m| wanted(m.severity))
}

/// Creates a connected sender/receiver pair.
pub fn report_channel(config: &ReportConfig) -> (ReportSender, ReportReceiver) {
    let shared = Arc::new(Shared {
        config: config.clone(),
        queue: Mutex::new(Queue::default()),
        suppression: Mutex::new(HashMap::new()),
        senders: AtomicUsize::new(1),
        notify: Notify::new(),
    });
    (
        ReportSender {
            shared: shared.clone(),
        },
        ReportReceiver { shared },
    )
}

/// Producer side. Cheap to clone; all clones share suppression state.
pub struct ReportSender {
    shared: Arc<Shared>,
}

impl ReportSender {
    /// Emits with the configured delay class of `severity`.
    /// Returns whether the message was announced.
    pub fn emit(&self, severity: Severity, text: impl Into<String>) -> bool {
        let delay = self.shared.default_delay(severity);
        self.emit_with(severity, text, delay)
    }

    /// Emits under an explicit delay class.
    pub fn emit_with(&self, severity: Severity, text: impl Into<String>, delay: DelayClass) -> bool {
        let text = text.into();
        let Some(repeats) = self.shared.admit(severity, &text, delay) else {
            trace!(%severity, text = %text, "suppressed repeated message");
            return false;
        };

        match severity {
            Severity::Developer => debug!(repeats, "{text}"),
            Severity::Info => info!(repeats, "{text}"),
            Severity::Warning => warn!(repeats, "{text}"),
            Severity::Error => error!(repeats, "{text}"),
            Severity::Critical => error!(repeats, critical = true, "{text}"),
        }

        self.shared.push(Message {
            severity,
            text,
            timestamp: Utc::now(),
            delay,
            repeats,
        });
        true
    }

    /// Shorthand for [`Severity::Developer`].
    pub fn developer(&self, text: impl Into<String>) -> bool {
        self.emit(Severity::Developer, text)
    }

    /// Shorthand for [`Severity::Info`].
    pub fn info(&self, text: impl Into<String>) -> bool {
        self.emit(Severity::Info, text)
    }

    /// Shorthand for [`Severity::Warning`].
    pub fn warning(&self, text: impl Into<String>) -> bool {
        self.emit(Severity::Warning, text)
    }

    /// Shorthand for [`Severity::Error`].
    pub fn error(&self, text: impl Into<String>) -> bool {
        self.emit(Severity::Error, text)
    }

    /// Shorthand for [`Severity::Critical`].
    pub fn critical(&self, text: impl Into<String>) -> bool {
        self.emit(Severity::Critical, text)
    }

    /// Messages discarded by back-pressure so far.
    pub fn dropped(&self) -> u64 {
        self.shared.queue().dropped
    }
}

impl Clone for ReportSender {
    fn clone(&self) -> Self {
        self.shared.senders.fetch_add(1, Ordering::SeqCst);
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl Drop for ReportSender {
    fn drop(&mut self) {
        if self.shared.senders.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.shared.notify.notify_one();
        }
    }
}

/// Consumer side.
pub struct ReportReceiver {
    shared: Arc<Shared>,
}

impl ReportReceiver {
    /// Waits for the next message. Returns `None` once every sender is gone
    /// and the queue is empty.
    pub async fn recv(&mut self) -> Option<Message> {
        let shared = Arc::clone(&self.shared);
        loop {
            let notified = shared.notify.notified();
            if let Some(message) = self.try_recv() {
                return Some(message);
            }
            if shared.senders.load(Ordering::SeqCst) == 0 {
                return None;
            }
            notified.await;
        }
    }

    /// Oldest queued message, without waiting.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.shared.queue().messages.pop_front()
    }

    /// Takes every queued message.
    pub fn drain(&mut self) -> Vec<Message> {
        self.shared.queue().messages.drain(..).collect()
    }

    /// Queued messages.
    pub fn len(&self) -> usize {
        self.shared.queue().messages.len()
    }

    /// No message queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages discarded by back-pressure so far.
    pub fn dropped(&self) -> u64 {
        self.shared.queue().dropped
    }
}
