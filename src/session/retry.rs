//! Bounded reconnection policy, one record per failing peer.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::RetryConfig;
use crate::session::events::SessionInput;
use crate::session::peer::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(5000),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_delay: config.retry_delay(),
        }
    }
}

#[derive(Debug)]
pub struct RetryRecord {
    pub peer_id: PeerId,
    pub attempt_count: u32,
    pending_timer: Option<JoinHandle<()>>,
}

impl RetryRecord {
    fn disarm(&mut self) {
        if let Some(timer) = self.pending_timer.take() {
            timer.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.pending_timer.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Scheduled { attempt: u32, delay: Duration },
    /// The budget is spent; the record has been discarded.
    Exhausted { attempts: u32 },
}

/// Timers deliver [`SessionInput::RetryDue`] into the orchestrator inbox.
pub struct RetryManager {
    policy: RetryPolicy,
    records: HashMap<PeerId, RetryRecord>,
    notify: mpsc::UnboundedSender<SessionInput>,
}

impl RetryManager {
    pub fn new(policy: RetryPolicy, notify: mpsc::UnboundedSender<SessionInput>) -> Self {
        Self {
            policy,
            records: HashMap::new(),
            notify,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn schedule_retry(&mut self, peer_id: &str) -> RetryDecision {
        let record = self
            .records
            .entry(peer_id.to_string())
            .or_insert_with(|| RetryRecord {
                peer_id: peer_id.to_string(),
                attempt_count: 0,
                pending_timer: None,
            });

        if record.attempt_count >= self.policy.max_retries {
            let attempts = record.attempt_count;
            record.disarm();
            self.records.remove(peer_id);
            return RetryDecision::Exhausted { attempts };
        }

        record.disarm();
        record.attempt_count += 1;

        let delay = self.policy.retry_delay;
        let notify = self.notify.clone();
        let target = peer_id.to_string();
        record.pending_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = notify.send(SessionInput::RetryDue(target));
        }));

        debug!(peer_id, attempt = record.attempt_count, ?delay, "retry armed");
        RetryDecision::Scheduled {
            attempt: record.attempt_count,
            delay,
        }
    }

    /// Marks the peer's timer as fired. Returns false when no record exists,
    /// meaning the retry was cancelled after the timer had already sent.
    pub fn on_fired(&mut self, peer_id: &str) -> bool {
        match self.records.get_mut(peer_id) {
            Some(record) => {
                record.pending_timer = None;
                true
            }
            None => false,
        }
    }

    /// The peer connected again; its record is no longer needed.
    pub fn succeeded(&mut self, peer_id: &str) {
        self.cancel(peer_id);
    }

    pub fn cancel(&mut self, peer_id: &str) {
        if let Some(mut record) = self.records.remove(peer_id) {
            record.disarm();
        }
    }

    pub fn reset_all(&mut self) {
        for (_, mut record) in self.records.drain() {
            record.disarm();
        }
    }

    pub fn attempts(&self, peer_id: &str) -> Option<u32> {
        self.records.get(peer_id).map(|r| r.attempt_count)
    }

    pub fn is_tracking(&self, peer_id: &str) -> bool {
        self.records.contains_key(peer_id)
    }

    pub fn pending_timers(&self) -> usize {
        self.records.values().filter(|r| r.is_armed()).count()
    }
}

impl Drop for RetryManager {
    fn drop(&mut self) {
        self.reset_all();
    }
}
