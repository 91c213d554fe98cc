//! Per-generation streaming session: token delivery, interruption, progress

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::protocol::{ChannelId, WorkerEvent};

/// Live state of the one in-flight generation
#[derive(Debug)]
pub struct StreamingSession {
    owner: ChannelId,
    events: mpsc::UnboundedSender<WorkerEvent>,
    cancel: CancellationToken,
    started: Instant,
    target_max_tokens: u32,
    tokens: AtomicU64,
    accumulated_len: AtomicUsize,
}

/// Point-in-time view of a session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStats {
    pub owner: ChannelId,
    pub tokens: u64,
    pub accumulated_len: usize,
    pub elapsed_ms: u64,
    /// Informational only; the target is not enforced
    pub progress_percent: u8,
    pub tokens_per_second: f64,
    pub interrupted: bool,
}

impl StreamingSession {
    pub fn new(
        owner: ChannelId,
        events: mpsc::UnboundedSender<WorkerEvent>,
        target_max_tokens: u32,
    ) -> Self {
        Self {
            owner,
            events,
            cancel: CancellationToken::new(),
            started: Instant::now(),
            target_max_tokens,
            tokens: AtomicU64::new(0),
            accumulated_len: AtomicUsize::new(0),
        }
    }

    pub fn owner(&self) -> &ChannelId {
        &self.owner
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Flip the interruption flag. Monotonic: once set it stays set.
    pub fn interrupt(&self) {
        self.cancel.cancel();
    }

    pub fn is_interrupted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Forward one token to the owner unless interrupted.
    /// Returns whether the token was delivered.
    pub fn push_token(&self, text: &str) -> bool {
        if self.is_interrupted() {
            return false;
        }
        self.tokens.fetch_add(1, Ordering::Relaxed);
        self.accumulated_len
            .fetch_add(text.chars().count(), Ordering::Relaxed);
        self.notify(WorkerEvent::StreamData {
            text: text.to_string(),
        });
        true
    }

    /// Send an event to the owning channel. A detached owner is not an error.
    pub fn notify(&self, event: WorkerEvent) {
        let _ = self.events.send(event);
    }

    pub fn stats(&self) -> SessionStats {
        let tokens = self.tokens.load(Ordering::Relaxed);
        let accumulated_len = self.accumulated_len.load(Ordering::Relaxed);
        let elapsed = self.started.elapsed();
        let secs = elapsed.as_secs_f64();
        SessionStats {
            owner: self.owner.clone(),
            tokens,
            accumulated_len,
            elapsed_ms: elapsed.as_millis() as u64,
            progress_percent: progress_percent(accumulated_len, self.target_max_tokens),
            tokens_per_second: if secs > 0.0 { tokens as f64 / secs } else { 0.0 },
            interrupted: self.is_interrupted(),
        }
    }
}

fn progress_percent(accumulated: usize, target: u32) -> u8 {
    if target == 0 {
        return 100;
    }
    let pct = accumulated.saturating_mul(100) / target as usize;
    pct.min(100) as u8
}
