//! Reliability Tracker
//!
//! Keeps outbound TEXT messages until their ACK arrives, hands them back for
//! retransmission after each timeout and reports them as failed once the
//! retry budget is spent.

use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::message::message_types::{Message, MessageId, PeerId};

/// Outbound message awaiting acknowledgment
#[derive(Debug, Clone)]
pub struct PendingAck {
    pub message_id: MessageId,
    pub destination: PeerId,
    pub sent_at: Instant,
    pub retry_count: u32,
    message: Message,
}

/// Result of one sweep
#[derive(Debug, Default)]
pub struct ReliabilitySweep {
    /// Copies to send again, attempt counter already bumped
    pub retransmit: Vec<Message>,
    /// Messages that exhausted their retries
    pub failed: Vec<MessageId>,
}

pub struct ReliabilityTracker {
    pending: Mutex<HashMap<MessageId, PendingAck>>,
    ack_timeout: Duration,
    max_retries: u32,
}

impl ReliabilityTracker {
    pub fn new(ack_timeout: Duration, max_retries: u32) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            ack_timeout,
            max_retries,
        }
    }

    /// Start waiting for an ACK of `message`
    pub fn track_outbound(&self, message: Message) {
        let destination = match message.destination.peer() {
            Some(peer_id) => peer_id.clone(),
            None => {
                debug!("Not tracking broadcast message {}", message.id);
                return;
            }
        };

        let pending = PendingAck {
            message_id: message.id.clone(),
            destination,
            sent_at: Instant::now(),
            retry_count: 0,
            message,
        };
        self.pending.lock().insert(pending.message_id.clone(), pending);
    }

    /// Settle a pending message. Returns false for unknown or already settled ids.
    pub fn on_ack(&self, message_id: &MessageId) -> bool {
        self.pending.lock().remove(message_id).is_some()
    }

    /// Stop tracking without reporting a failure
    pub fn cancel(&self, message_id: &MessageId) {
        self.pending.lock().remove(message_id);
    }

    /// Collect retransmissions and failures for entries older than the ACK timeout
    pub fn sweep(&self, now: Instant) -> ReliabilitySweep {
        let mut result = ReliabilitySweep::default();
        let mut pending = self.pending.lock();

        pending.retain(|message_id, entry| {
            if now.duration_since(entry.sent_at) < self.ack_timeout {
                return true;
            }

            if entry.retry_count >= self.max_retries {
                warn!(
                    "No acknowledgment for {} after {} retries",
                    message_id, entry.retry_count
                );
                result.failed.push(message_id.clone());
                return false;
            }

            entry.retry_count += 1;
            entry.sent_at = now;
            entry.message.attempt = entry.message.attempt.saturating_add(1);
            debug!(
                "Retransmitting {} to {} (retry {}/{})",
                message_id, entry.destination, entry.retry_count, self.max_retries
            );
            result.retransmit.push(entry.message.clone());
            true
        });

        result
    }

    /// Drop everything still pending and return the abandoned ids
    pub fn abandon_all(&self) -> Vec<MessageId> {
        let mut abandoned: Vec<MessageId> = self.pending.lock().drain().map(|(id, _)| id).collect();
        abandoned.sort();
        abandoned
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_pending(&self, message_id: &MessageId) -> bool {
        self.pending.lock().contains_key(message_id)
    }

    pub fn pending(&self) -> Vec<PendingAck> {
        let mut entries: Vec<PendingAck> = self.pending.lock().values().cloned().collect();
        entries.sort_by(|a, b| a.message_id.cmp(&b.message_id));
        entries
    }
}
